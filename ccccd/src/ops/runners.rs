//! Runner-state ops: headless session lifecycle and terminal transcripts.

use serde_json::Value;

use cccc_core::actor::{ActorRole, effective_role, find_actor};
use cccc_core::error::{OpError, OpResult};
use cccc_core::transcript::get_transcript_settings;

use super::{arg_by, arg_str, require_group};
use crate::headless::HEADLESS_STATUSES;
use crate::server::Daemon;

pub async fn headless_status(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let state = daemon
        .headless
        .get_state(&group.group_id, &actor_id)
        .ok_or_else(|| {
            OpError::new(
                "session_not_found",
                format!("headless session not found: {actor_id}"),
            )
        })?;
    Ok(serde_json::json!({"state": state}))
}

/// Status update, driven by the agent itself over MCP.
pub async fn headless_set_status(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let status = arg_str(args, "status");
    if !HEADLESS_STATUSES.contains(&status.as_str()) {
        return Err(OpError::new(
            "invalid_status",
            format!("invalid status: {status}"),
        ));
    }
    let task_id = arg_str(args, "task_id");
    let task_id = if task_id.is_empty() { None } else { Some(task_id.as_str()) };

    if !daemon
        .headless
        .set_status(&group.group_id, &actor_id, &status, task_id)
    {
        return Err(OpError::new(
            "session_not_found",
            format!("headless session not found: {actor_id}"),
        ));
    }
    let state = daemon.headless.get_state(&group.group_id, &actor_id);
    Ok(serde_json::json!({"state": state}))
}

pub async fn headless_ack_message(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let message_id = arg_str(args, "message_id");
    if message_id.is_empty() {
        return Err(OpError::new("missing_message_id", "missing message_id"));
    }
    if !daemon
        .headless
        .set_last_message(&group.group_id, &actor_id, &message_id)
    {
        return Err(OpError::new(
            "session_not_found",
            format!("headless session not found: {actor_id}"),
        ));
    }
    Ok(serde_json::json!({
        "message_id": message_id,
        "acked_at": cccc_core::timeutil::utc_now_iso(),
    }))
}

/// Return the tail of an actor's terminal output. The human user is always
/// allowed; actor access is governed by the group's transcript visibility
/// (own transcripts are always readable).
pub async fn term_tail(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let by = arg_by(args);

    if by != "user" && by != actor_id {
        if find_actor(&group, &by).is_none() {
            return Err(OpError::permission_denied(format!("unknown actor: {by}")));
        }
        let settings = get_transcript_settings(&group.doc.terminal_transcript);
        let allowed = match settings.visibility.as_str() {
            "all" => true,
            "foreman" => effective_role(&group, &by) == ActorRole::Foreman,
            _ => false,
        };
        if !allowed {
            return Err(OpError::permission_denied(format!(
                "{by} cannot read the transcript of {actor_id}"
            )));
        }
    }

    let max_bytes = args
        .get("max_bytes")
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as usize;
    let tail = daemon.supervisor.tail_output(&group.group_id, &actor_id, max_bytes);
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "actor_id": actor_id,
        "bytes": tail.len(),
        "text": String::from_utf8_lossy(&tail),
    }))
}
