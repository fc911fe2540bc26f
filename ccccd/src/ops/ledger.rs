//! Ledger maintenance and group-context ops.

use serde_json::Value;

use cccc_core::error::{OpError, OpResult};
use cccc_core::permissions::{GroupAction, require_group_permission};
use cccc_core::retention;

use super::{arg_bool, arg_by, arg_str, require_group};
use crate::server::Daemon;

pub async fn ledger_snapshot(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    let reason = arg_str(args, "reason");
    require_group_permission(&group, &by, GroupAction::Update)?;

    let snap = retention::snapshot(&group, if reason.is_empty() { "manual" } else { &reason })
        .map_err(|e| OpError::new("ledger_snapshot_failed", e.to_string()))?;
    Ok(serde_json::json!({"snapshot": snap}))
}

pub async fn ledger_compact(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    let reason = arg_str(args, "reason");
    let force = arg_bool(args, "force");
    require_group_permission(&group, &by, GroupAction::Update)?;

    retention::compact(&group, if reason.is_empty() { "auto" } else { &reason }, force)
        .map_err(|e| OpError::new("ledger_compact_failed", e.to_string()))
}

/// Write one context document and record the sync in the ledger. Any group
/// member (or the user) may contribute context.
pub async fn context_set(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    if by != "user" && cccc_core::actor::find_actor(&group, &by).is_none() {
        return Err(OpError::permission_denied(format!("unknown actor: {by}")));
    }

    let name = arg_str(args, "name");
    let name = cccc_core::blobs::sanitize_filename(&name, "");
    if name.is_empty() {
        return Err(OpError::new("missing_path", "missing context document name"));
    }
    let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");

    let filename = if name.contains('.') { name.clone() } else { format!("{name}.md") };
    let path = group.path.join("context").join(&filename);
    cccc_core::fsutil::atomic_write_text(&path, text)
        .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    let event = cccc_core::ledger::append_event(
        &group.ledger_path(),
        "context.sync",
        &group.group_id,
        "",
        &by,
        serde_json::json!({
            "version": "",
            "changes": [{"doc": filename, "bytes": text.len()}],
        }),
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    Ok(serde_json::json!({
        "group_id": group.group_id,
        "doc": filename,
        "event": event,
    }))
}

/// Return the group's context documents (vision/tasks/notes) by file stem.
pub async fn context_get(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let context_dir = group.path.join("context");
    let mut docs = serde_json::Map::new();
    if let Ok(entries) = std::fs::read_dir(&context_dir) {
        let mut paths: Vec<_> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if let Ok(text) = std::fs::read_to_string(&path) {
                docs.insert(stem, Value::String(text));
            }
        }
    }
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "context": Value::Object(docs),
    }))
}
