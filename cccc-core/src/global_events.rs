//! Daemon-wide event log (`daemon/ccccd.events.jsonl`).
//!
//! Local writers append small JSONL entries here so out-of-process readers
//! (the web port's SSE stream) can invalidate cached state. Cross-process
//! appends are serialized by an adjacent lock file. Publishing is strictly
//! best-effort: it never fails the caller.

use std::io::Write;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use crate::lock;
use crate::timeutil::utc_now_iso;

pub fn global_events_path(home: &Path) -> std::path::PathBuf {
    home.join("daemon").join("ccccd.events.jsonl")
}

fn global_events_lock_path(home: &Path) -> std::path::PathBuf {
    home.join("daemon").join("ccccd.events.lock")
}

/// Append a global event. Failures are logged at debug and swallowed.
pub fn publish_event(home: &Path, kind: &str, data: Value) {
    let kind = kind.trim();
    if kind.is_empty() {
        return;
    }
    if let Err(e) = publish_inner(home, kind, data) {
        debug!(err = %e, kind, "failed to publish global event");
    }
}

fn publish_inner(home: &Path, kind: &str, data: Value) -> anyhow::Result<()> {
    let entry = serde_json::json!({
        "v": 1,
        "id": uuid::Uuid::new_v4().simple().to_string(),
        "ts": utc_now_iso(),
        "kind": kind,
        "data": if data.is_object() { data } else { Value::Object(Default::default()) },
    });
    let path = global_events_path(home);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let _guard = lock::acquire_exclusive(&global_events_lock_path(home))?;
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)?;
    let mut line = serde_json::to_string(&entry)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_one_line_per_event() {
        let home = tempfile::tempdir().unwrap();
        publish_event(home.path(), "group.created", serde_json::json!({"group_id": "g_1"}));
        publish_event(home.path(), "group.deleted", serde_json::json!({"group_id": "g_1"}));

        let raw = std::fs::read_to_string(global_events_path(home.path())).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "group.created");
        assert_eq!(first["data"]["group_id"], "g_1");
    }

    #[test]
    fn blank_kind_is_dropped() {
        let home = tempfile::tempdir().unwrap();
        publish_event(home.path(), "  ", Value::Null);
        assert!(!global_events_path(home.path()).exists());
    }
}
