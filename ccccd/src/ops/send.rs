//! The `send` op: append a chat message and push it into recipient PTYs.

use serde_json::Value;

use cccc_core::actor::{list_actors, resolve_recipient_tokens};
use cccc_core::error::{OpError, OpResult};
use cccc_core::inbox::is_message_for_actor;
use cccc_core::ledger::{append_event, find_event};
use cccc_core::messaging::default_reply_recipients;
use cccc_core::registry::Registry;
use cccc_core::scope::detect_scope;

use super::{arg_by, arg_str, arg_str_list, require_group};
use crate::delivery::render_delivery_text;
use crate::server::Daemon;

pub async fn send(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    let text = args
        .get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let mut to = resolve_recipient_tokens(&group, &arg_str_list(args, "to"))?;

    // A reply with no explicit recipients inherits the original audience.
    let reply_to = arg_str(args, "reply_to");
    let quote_text = arg_str(args, "quote_text");
    if to.is_empty() && !reply_to.is_empty() {
        if let Some(original) = find_event(&group.ledger_path(), &reply_to) {
            to = default_reply_recipients(&group, &by, &original);
        }
    }

    // Explicit path (CLI `--path`) must name an attached scope.
    let path = arg_str(args, "path");
    let scope_key = if path.is_empty() {
        group.doc.active_scope_key.trim().to_string()
    } else {
        let scope = detect_scope(std::path::Path::new(&path));
        if !group.has_scope(&scope.scope_key) {
            return Err(OpError::scope_not_attached(&scope.scope_key));
        }
        scope.scope_key
    };

    let mut data = serde_json::json!({
        "text": text,
        "format": "plain",
        "to": to,
    });
    if !reply_to.is_empty() {
        data["reply_to"] = Value::String(reply_to.clone());
    }
    if !quote_text.is_empty() {
        data["quote_text"] = Value::String(quote_text.clone());
    }
    if let Some(attachments) = args.get("attachments").filter(|v| v.is_array()) {
        data["attachments"] = attachments.clone();
    }

    let event = append_event(
        &group.ledger_path(),
        "chat.message",
        &group.group_id,
        &scope_key,
        &by,
        data,
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    // Keep group ordering IM-like: sends bump the registry timestamp.
    if let Ok(mut reg) = Registry::load(&daemon.home) {
        if let Some(meta) = reg.doc.groups.get_mut(&group.group_id) {
            meta.updated_at = event.ts.clone();
            let _ = reg.save();
        }
    }

    // A sender echoing a MID token acknowledges its pending handoff.
    daemon
        .delivery
        .note_ack(
            &daemon.supervisor,
            &group,
            &by,
            &text,
            Some(reply_to.as_str()).filter(|r| !r.is_empty()),
        )
        .await;

    // Best-effort PTY delivery to explicit recipients, unless paused.
    if !to.is_empty() && !group.doc.is_paused() {
        let mid: String = event.id.chars().take(8).collect();
        let rendered = render_delivery_text(
            &by,
            &to,
            &text,
            Some(reply_to.as_str()).filter(|r| !r.is_empty()),
            Some(quote_text.as_str()).filter(|q| !q.is_empty()),
        );
        let recipients: Vec<(String, cccc_core::actor::RunnerKind)> = list_actors(&group)
            .iter()
            .filter(|a| a.enabled && a.id != by && a.id != "user")
            .filter(|a| is_message_for_actor(&group, &a.id, &event))
            .map(|a| (a.id.clone(), a.runner))
            .collect();
        for (actor_id, runner) in recipients {
            if runner == cccc_core::actor::RunnerKind::Headless {
                // Headless actors pull from a file mailbox instead of a PTY.
                if let Err(e) =
                    crate::delivery::write_mailbox_message(&group, &actor_id, &mid, &rendered)
                {
                    tracing::warn!(err = %e, actor_id, "mailbox delivery failed");
                }
                continue;
            }
            let delivered = daemon
                .delivery
                .deliver(&daemon.supervisor, &group, &actor_id, &by, &mid, &rendered)
                .await;
            if delivered {
                daemon
                    .automation
                    .on_delivered_message(&group, &daemon.supervisor, &actor_id, &by)
                    .await;
            }
        }

        // Peer-to-peer progress reports schedule a keep-alive for the sender.
        daemon
            .automation
            .maybe_schedule_keepalive(&group, &by, &text)
            .await;
    }

    Ok(serde_json::json!({"event": event}))
}
