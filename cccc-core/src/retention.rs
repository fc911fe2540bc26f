//! Ledger retention: snapshots and compaction.
//!
//! Compaction archives events every actor has already read (the *global safe
//! cursor* is the minimum read-cursor timestamp) while always preserving the
//! last `keep_tail_lines` lines of the active file. The active ledger is
//! replaced atomically; an exclusive lock serializes compactions across
//! processes.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::fsutil::{atomic_write_json, read_json_or_default};
use crate::group::Group;
use crate::inbox::load_cursors;
use crate::ledger::read_last_lines;
use crate::lock;
use crate::timeutil::{parse_utc_iso, utc_now_iso, utc_stamp};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionRecord {
    pub v: u32,
    pub last_compacted_at: String,
    pub reason: String,
    pub safe_ts: String,
    pub archived_lines: usize,
    pub kept_lines: usize,
    pub archive_path: String,
}

fn ledger_state_dir(group: &Group) -> PathBuf {
    group.state_dir().join("ledger")
}

fn compaction_state_path(group: &Group) -> PathBuf {
    ledger_state_dir(group).join("compaction.json")
}

fn ledger_lock_path(group: &Group) -> PathBuf {
    ledger_state_dir(group).join("ledger.lock")
}

/// Minimum read-cursor timestamp across all actors, if any cursor exists.
fn global_safe_cursor(group: &Group) -> Option<(String, DateTime<Utc>)> {
    let mut best: Option<(String, DateTime<Utc>)> = None;
    for cursor in load_cursors(group).values() {
        let Some(dt) = parse_utc_iso(&cursor.ts) else {
            continue;
        };
        if best.as_ref().is_none_or(|(_, b)| dt < *b) {
            best = Some((cursor.ts.clone(), dt));
        }
    }
    best
}

/// Write a lightweight snapshot sidecar: active size + last event summary.
pub fn snapshot(group: &Group, reason: &str) -> anyhow::Result<Value> {
    let active = group.ledger_path();
    let size = std::fs::metadata(&active).map(|m| m.len()).unwrap_or(0);

    let last_event = read_last_lines(&active, 1)
        .first()
        .and_then(|line| serde_json::from_str::<Value>(line).ok())
        .map(|obj| {
            serde_json::json!({
                "id": obj.get("id").cloned().unwrap_or(Value::Null),
                "ts": obj.get("ts").cloned().unwrap_or(Value::Null),
                "kind": obj.get("kind").cloned().unwrap_or(Value::Null),
                "by": obj.get("by").cloned().unwrap_or(Value::Null),
            })
        })
        .unwrap_or_else(|| Value::Object(Default::default()));

    let snap_dir = ledger_state_dir(group).join("snapshots");
    std::fs::create_dir_all(&snap_dir)?;
    let path = snap_dir.join(format!("snapshot.{}.json", utc_stamp()));
    let doc = serde_json::json!({
        "v": 1,
        "kind": "ledger.snapshot",
        "group_id": group.group_id,
        "created_at": utc_now_iso(),
        "reason": if reason.is_empty() { "manual" } else { reason },
        "active_ledger": {"path": "ledger.jsonl", "size_bytes": size},
        "last_event": last_event,
    });
    atomic_write_json(&path, &doc)?;
    atomic_write_json(&ledger_state_dir(group).join("snapshot.latest.json"), &doc)?;

    Ok(serde_json::json!({
        "snapshot_path": path.to_string_lossy(),
        "size_bytes": size,
        "last_event": doc["last_event"],
    }))
}

/// Compact the active ledger. Returns a result object describing what
/// happened; skips (with a reason) when thresholds do not pass.
pub fn compact(group: &Group, reason: &str, force: bool) -> anyhow::Result<Value> {
    let active = group.ledger_path();
    if !active.exists() {
        return Ok(serde_json::json!({"ok": false, "skipped": true, "reason": "missing_ledger"}));
    }
    let cfg = &group.doc.ledger;

    let state: CompactionRecord = read_json_or_default(&compaction_state_path(group));
    if !force && cfg.min_interval_seconds > 0 {
        if let Some(last) = parse_utc_iso(&state.last_compacted_at) {
            let age = (Utc::now() - last).num_seconds();
            if age >= 0 && (age as u64) < cfg.min_interval_seconds {
                return Ok(
                    serde_json::json!({"ok": true, "skipped": true, "reason": "min_interval"}),
                );
            }
        }
    }

    let size = std::fs::metadata(&active)?.len();
    if !force && cfg.max_active_bytes > 0 && size < cfg.max_active_bytes {
        return Ok(serde_json::json!({
            "ok": true, "skipped": true, "reason": "below_threshold", "size_bytes": size,
        }));
    }

    let Some((safe_ts, safe_dt)) = global_safe_cursor(group) else {
        return Ok(serde_json::json!({"ok": true, "skipped": true, "reason": "no_global_cursor"}));
    };

    let _guard = lock::acquire_exclusive(&ledger_lock_path(group))?;

    let raw = std::fs::read_to_string(&active)?;
    let total_lines = raw.lines().count();
    let cutoff = if cfg.keep_tail_lines > 0 {
        total_lines.saturating_sub(cfg.keep_tail_lines)
    } else {
        total_lines
    };
    if cutoff == 0 {
        return Ok(serde_json::json!({
            "ok": true, "skipped": true, "reason": "nothing_to_archive", "total_lines": total_lines,
        }));
    }

    let archive_dir = ledger_state_dir(group).join("archive");
    std::fs::create_dir_all(&archive_dir)?;
    let archive_path = archive_dir.join(format!("ledger.{}.jsonl", utc_stamp()));

    let parent = active.parent().unwrap_or_else(|| std::path::Path::new("."));
    let mut keep_file = tempfile::NamedTempFile::new_in(parent)?;
    let mut archive_file: Option<std::fs::File> = None;
    let mut archived = 0usize;
    let mut kept = 0usize;

    for (idx, line) in raw.lines().enumerate() {
        let archivable = idx < cutoff
            && serde_json::from_str::<Value>(line)
                .ok()
                .and_then(|obj| obj.get("ts").and_then(|v| v.as_str()).map(String::from))
                .and_then(|ts| parse_utc_iso(&ts))
                .is_some_and(|dt| dt <= safe_dt);
        if archivable {
            if archive_file.is_none() {
                archive_file = Some(std::fs::File::create(&archive_path)?);
            }
            let f = archive_file.as_mut().expect("created above");
            writeln!(f, "{line}")?;
            archived += 1;
        } else {
            writeln!(keep_file, "{line}")?;
            kept += 1;
        }
    }

    if archived == 0 {
        let _ = std::fs::remove_file(&archive_path);
        return Ok(serde_json::json!({
            "ok": true, "skipped": true, "reason": "no_archivable_events", "safe_ts": safe_ts,
        }));
    }
    keep_file.flush()?;
    keep_file.persist(&active)?;

    let record = CompactionRecord {
        v: 1,
        last_compacted_at: utc_now_iso(),
        reason: if reason.is_empty() { "auto" } else { reason }.to_string(),
        safe_ts: safe_ts.clone(),
        archived_lines: archived,
        kept_lines: kept,
        archive_path: archive_path.to_string_lossy().to_string(),
    };
    atomic_write_json(&compaction_state_path(group), &record)?;
    let snap = snapshot(group, &format!("compact:{}", record.reason))?;

    Ok(serde_json::json!({
        "ok": true,
        "skipped": false,
        "result": serde_json::to_value(&record)?,
        "snapshot": snap,
    }))
}
