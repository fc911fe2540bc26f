//! Inbox ops: unread listing and read receipts.

use serde_json::Value;

use cccc_core::error::{OpError, OpResult};
use cccc_core::inbox::{get_cursor, set_cursor, unread_messages};
use cccc_core::ledger::{append_event, find_event};
use cccc_core::permissions::require_inbox_permission;

use super::{arg_by, arg_str, require_group};
use crate::server::Daemon;

pub async fn inbox_list(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let by = arg_by(args);
    require_inbox_permission(&group, &by, &actor_id)?;

    let limit = args
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(50) as usize;
    let messages = unread_messages(&group, &actor_id, limit);
    let cursor = get_cursor(&group, &actor_id);
    Ok(serde_json::json!({
        "messages": messages,
        "cursor": {"event_id": cursor.event_id, "ts": cursor.ts},
    }))
}

pub async fn inbox_mark_read(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let event_id = arg_str(args, "event_id");
    if event_id.is_empty() {
        return Err(OpError::missing_event_id());
    }
    let by = arg_by(args);
    require_inbox_permission(&group, &by, &actor_id)?;

    let event = find_event(&group.ledger_path(), &event_id)
        .ok_or_else(|| OpError::event_not_found(&event_id))?;
    let cursor = set_cursor(&group, &actor_id, &event.id, &event.ts)
        .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    let read_event = append_event(
        &group.ledger_path(),
        "chat.read",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id, "event_id": event_id}),
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    Ok(serde_json::json!({"cursor": cursor, "event": read_event}))
}
