//! Daemon op dispatch.
//!
//! Each op is a pure request → response unit: handlers validate, mutate
//! state through the kernel, append the matching ledger event, and never
//! leak errors to the socket (every failure becomes a coded error
//! response). Mutating ops run under the daemon-wide op lock, preserving
//! the single-writer guarantee.

mod actors;
mod groups;
mod inbox;
mod ledger;
mod runners;
mod send;
mod templates;

use serde_json::Value;

use cccc_core::error::{OpError, OpResult};
use cccc_core::group::Group;
use cccc_core::ipc::{DaemonRequest, DaemonResponse};
use cccc_core::timeutil::utc_now_iso;

use crate::server::Daemon;

pub use actors::spawn_enabled_actors;

/// Dispatch one request. The second return value signals server exit.
pub async fn dispatch(daemon: &Daemon, req: DaemonRequest) -> (DaemonResponse, bool) {
    let op = req.op.trim().to_string();
    let args = req.args.clone();

    if op == "ping" {
        let result = serde_json::json!({
            "version": cccc_core::VERSION,
            "pid": std::process::id(),
            "ts": utc_now_iso(),
        });
        return (DaemonResponse::success(result), false);
    }
    if op == "shutdown" {
        daemon.supervisor.stop_all().await;
        daemon.headless.stop_all();
        return (
            DaemonResponse::success(serde_json::json!({"message": "shutting down"})),
            true,
        );
    }

    // All remaining ops serialize: one writer at a time per daemon.
    let _guard = daemon.op_lock.lock().await;
    let outcome: OpResult<Value> = match op.as_str() {
        "attach" => groups::attach(daemon, &args).await,
        "group_create" => groups::group_create(daemon, &args).await,
        "group_show" => groups::group_show(daemon, &args).await,
        "group_update" => groups::group_update(daemon, &args).await,
        "group_detach_scope" => groups::group_detach_scope(daemon, &args).await,
        "group_delete" => groups::group_delete(daemon, &args).await,
        "group_use" => groups::group_use(daemon, &args).await,
        "groups" => groups::groups(daemon, &args).await,
        "group_start" => groups::group_start(daemon, &args).await,
        "group_stop" => groups::group_stop(daemon, &args).await,
        "group_set_state" => groups::group_set_state(daemon, &args).await,
        "actor_list" => actors::actor_list(daemon, &args).await,
        "actor_add" => actors::actor_add(daemon, &args).await,
        "actor_remove" => actors::actor_remove(daemon, &args).await,
        "actor_update" => actors::actor_update(daemon, &args).await,
        "actor_start" => actors::actor_start(daemon, &args).await,
        "actor_stop" => actors::actor_stop(daemon, &args).await,
        "actor_restart" => actors::actor_restart(daemon, &args).await,
        "actor_reorder" => actors::actor_reorder(daemon, &args).await,
        "actor_set_role" => actors::actor_set_role(daemon, &args).await,
        "term_resize" => actors::term_resize(daemon, &args).await,
        "inbox_list" => inbox::inbox_list(daemon, &args).await,
        "inbox_mark_read" => inbox::inbox_mark_read(daemon, &args).await,
        "ledger_snapshot" => ledger::ledger_snapshot(daemon, &args).await,
        "ledger_compact" => ledger::ledger_compact(daemon, &args).await,
        "context_get" => ledger::context_get(daemon, &args).await,
        "context_set" => ledger::context_set(daemon, &args).await,
        "headless_status" => runners::headless_status(daemon, &args).await,
        "headless_set_status" => runners::headless_set_status(daemon, &args).await,
        "headless_ack_message" => runners::headless_ack_message(daemon, &args).await,
        "term_tail" => runners::term_tail(daemon, &args).await,
        "group_export_template" => templates::group_export_template(daemon, &args).await,
        "group_apply_template" => templates::group_apply_template(daemon, &args).await,
        "send" => send::send(daemon, &args).await,
        _ => Err(OpError::new("unknown_op", format!("unknown op: {op}"))),
    };

    match outcome {
        Ok(result) => (DaemonResponse::success(result), false),
        Err(err) => (err.into(), false),
    }
}

// --- shared argument helpers -------------------------------------------------

pub(crate) fn arg_str(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string()
}

pub(crate) fn arg_by(args: &Value) -> String {
    let by = arg_str(args, "by");
    if by.is_empty() { "user".to_string() } else { by }
}

pub(crate) fn arg_bool(args: &Value, key: &str) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

pub(crate) fn arg_str_list(args: &Value, key: &str) -> Vec<String> {
    args.get(key)
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

pub(crate) fn require_group(daemon: &Daemon, args: &Value) -> OpResult<Group> {
    let group_id = arg_str(args, "group_id");
    if group_id.is_empty() {
        return Err(OpError::missing_group_id());
    }
    cccc_core::group::load_group(&daemon.home, &group_id)
        .ok_or_else(|| OpError::group_not_found(&group_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn daemon() -> (tempfile::TempDir, Daemon) {
        let home = tempfile::tempdir().unwrap();
        let daemon = Daemon {
            home: home.path().to_path_buf(),
            supervisor: Arc::new(crate::pty::PtySupervisor::new()),
            headless: Arc::new(crate::headless::HeadlessSupervisor::new()),
            delivery: Arc::new(crate::delivery::DeliveryManager::new()),
            automation: Arc::new(crate::automation::AutomationManager::new()),
            op_lock: tokio::sync::Mutex::new(()),
        };
        (home, daemon)
    }

    async fn call(daemon: &Daemon, op: &str, args: Value) -> DaemonResponse {
        let (resp, _) = dispatch(daemon, DaemonRequest::new(op, args)).await;
        resp
    }

    #[tokio::test]
    async fn ping_and_unknown_op() {
        let (_home, daemon) = daemon();
        let ping = call(&daemon, "ping", serde_json::json!({})).await;
        assert!(ping.ok);
        assert_eq!(ping.result["version"], cccc_core::VERSION);

        let unknown = call(&daemon, "nope", serde_json::json!({})).await;
        assert_eq!(unknown.error_code(), Some("unknown_op"));
    }

    #[tokio::test]
    async fn group_create_show_update_delete_flow() {
        let (_home, daemon) = daemon();
        let created = call(
            &daemon,
            "group_create",
            serde_json::json!({"title": "ops test", "by": "user"}),
        )
        .await;
        assert!(created.ok);
        let gid = created.result["group_id"].as_str().unwrap().to_string();

        let show = call(&daemon, "group_show", serde_json::json!({"group_id": gid})).await;
        assert_eq!(show.result["group"]["title"], "ops test");

        let updated = call(
            &daemon,
            "group_update",
            serde_json::json!({"group_id": gid, "patch": {"topic": "new topic"}, "by": "user"}),
        )
        .await;
        assert!(updated.ok);
        assert_eq!(updated.result["group"]["topic"], "new topic");

        let bad_patch = call(
            &daemon,
            "group_update",
            serde_json::json!({"group_id": gid, "patch": {"running": true}, "by": "user"}),
        )
        .await;
        assert_eq!(bad_patch.error_code(), Some("invalid_patch"));

        let deleted = call(
            &daemon,
            "group_delete",
            serde_json::json!({"group_id": gid, "by": "user"}),
        )
        .await;
        assert!(deleted.ok);
        let gone = call(&daemon, "group_show", serde_json::json!({"group_id": gid})).await;
        assert_eq!(gone.error_code(), Some("group_not_found"));
    }

    #[tokio::test]
    async fn actor_roster_flow_with_roles() {
        let (_home, daemon) = daemon();
        let created = call(
            &daemon,
            "group_create",
            serde_json::json!({"title": "g", "by": "user"}),
        )
        .await;
        let gid = created.result["group_id"].as_str().unwrap().to_string();

        for actor in ["alpha", "beta"] {
            let resp = call(
                &daemon,
                "actor_add",
                serde_json::json!({"group_id": gid, "actor_id": actor, "by": "user"}),
            )
            .await;
            assert!(resp.ok, "add {actor} failed: {:?}", resp.error);
        }

        let list = call(
            &daemon,
            "actor_list",
            serde_json::json!({"group_id": gid, "by": "user"}),
        )
        .await;
        let actors = list.result["actors"].as_array().unwrap().clone();
        assert_eq!(actors[0]["role"], "foreman");
        assert_eq!(actors[1]["role"], "peer");

        let reordered = call(
            &daemon,
            "actor_reorder",
            serde_json::json!({"group_id": gid, "actor_ids": ["beta", "alpha"], "by": "user"}),
        )
        .await;
        assert!(reordered.ok);
        assert_eq!(reordered.result["actors"][0]["id"], "beta");
        assert_eq!(reordered.result["actors"][0]["role"], "foreman");

        let removed = call(
            &daemon,
            "actor_remove",
            serde_json::json!({"group_id": gid, "actor_id": "alpha", "by": "user"}),
        )
        .await;
        assert!(removed.ok);
        let missing = call(
            &daemon,
            "actor_remove",
            serde_json::json!({"group_id": gid, "actor_id": "alpha", "by": "user"}),
        )
        .await;
        assert_eq!(missing.error_code(), Some("actor_not_found"));
    }

    #[tokio::test]
    async fn send_validates_recipients() {
        let (_home, daemon) = daemon();
        let created = call(
            &daemon,
            "group_create",
            serde_json::json!({"title": "g", "by": "user"}),
        )
        .await;
        let gid = created.result["group_id"].as_str().unwrap().to_string();

        let unknown = call(
            &daemon,
            "send",
            serde_json::json!({"group_id": gid, "text": "x", "by": "user", "to": ["ghost"]}),
        )
        .await;
        assert_eq!(unknown.error_code(), Some("invalid_recipient"));

        let ok = call(
            &daemon,
            "send",
            serde_json::json!({"group_id": gid, "text": "x", "by": "user", "to": []}),
        )
        .await;
        assert!(ok.ok);
        assert_eq!(ok.result["event"]["kind"], "chat.message");
    }

    #[tokio::test]
    async fn context_set_then_get_round_trips() {
        let (_home, daemon) = daemon();
        let created = call(
            &daemon,
            "group_create",
            serde_json::json!({"title": "g", "by": "user"}),
        )
        .await;
        let gid = created.result["group_id"].as_str().unwrap().to_string();

        let set = call(
            &daemon,
            "context_set",
            serde_json::json!({"group_id": gid, "name": "vision", "text": "ship it", "by": "user"}),
        )
        .await;
        assert!(set.ok);
        assert_eq!(set.result["doc"], "vision.md");

        let get = call(&daemon, "context_get", serde_json::json!({"group_id": gid})).await;
        assert_eq!(get.result["context"]["vision"], "ship it");

        // An outsider cannot write context.
        let denied = call(
            &daemon,
            "context_set",
            serde_json::json!({"group_id": gid, "name": "vision", "text": "x", "by": "stranger"}),
        )
        .await;
        assert_eq!(denied.error_code(), Some("permission_denied"));
    }
}
