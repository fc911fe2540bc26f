//! Append-only JSONL ledger.
//!
//! One JSON object per line; the line order within a file is the canonical
//! delivery order for a group. Appends prepare the full line and issue a
//! single `O_APPEND` write so concurrent tailers never see interleaved
//! fragments. Readers must tolerate a partial trailing line (writer crash
//! mid-line) by ignoring anything not terminated with `\n`.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;
use serde_json::Value;

use crate::event::{Event, normalize_event_data};

/// Validate `data` for `kind`, build the envelope with a fresh id and UTC
/// timestamp, and append it as one line. Returns the event as written.
pub fn append_event(
    ledger_path: &Path,
    kind: &str,
    group_id: &str,
    scope_key: &str,
    by: &str,
    data: Value,
) -> anyhow::Result<Event> {
    let data = normalize_event_data(kind, data)?;
    let event = Event::new(kind, group_id, scope_key, by, data);

    if let Some(parent) = ledger_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(&event)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(ledger_path)
        .with_context(|| format!("failed to open ledger {}", ledger_path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("failed to append to {}", ledger_path.display()))?;
    Ok(event)
}

/// Read the last `n` lines by seeking backwards in 8 KiB blocks.
pub fn read_last_lines(path: &Path, n: usize) -> Vec<String> {
    if n == 0 || !path.exists() {
        return Vec::new();
    }
    let Ok(mut file) = std::fs::File::open(path) else {
        return Vec::new();
    };
    let Ok(mut size) = file.seek(SeekFrom::End(0)) else {
        return Vec::new();
    };

    const BLOCK: u64 = 8192;
    let mut data: Vec<u8> = Vec::new();
    while size > 0 && data.iter().filter(|&&b| b == b'\n').count() <= n {
        let step = BLOCK.min(size);
        size -= step;
        if file.seek(SeekFrom::Start(size)).is_err() {
            break;
        }
        let mut block = vec![0u8; step as usize];
        if file.read_exact(&mut block).is_err() {
            break;
        }
        block.extend_from_slice(&data);
        data = block;
    }

    let text = String::from_utf8_lossy(&data);
    let mut lines: Vec<String> = text.lines().map(|l| l.to_string()).collect();
    if lines.len() > n {
        lines.drain(..lines.len() - n);
    }
    lines
}

/// Iterate all parseable events in order, skipping blank and malformed lines
/// (including a partial trailing line).
pub fn iter_events(path: &Path) -> Vec<Event> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in raw.split_inclusive('\n') {
        if !line.ends_with('\n') {
            // Partial trailing line: a writer may still be mid-append.
            continue;
        }
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if let Ok(ev) = serde_json::from_str::<Event>(text) {
            out.push(ev);
        }
    }
    out
}

/// Incremental reader for tailing a ledger file.
///
/// `poll_lines` returns newly appended complete lines; a partial trailing
/// line (writer mid-append) is left unconsumed and re-read next time.
/// Truncation (compaction rewrote the file smaller) resets to the new end.
#[derive(Debug)]
pub struct LedgerFollower {
    path: std::path::PathBuf,
    offset: u64,
}

impl LedgerFollower {
    /// Start at the current end of the file (tail -f semantics).
    pub fn from_end(path: &Path) -> Self {
        let offset = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        Self {
            path: path.to_path_buf(),
            offset,
        }
    }

    /// Start at the beginning (replay everything).
    pub fn from_start(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Newly appended complete lines since the last poll.
    pub fn poll_lines(&mut self) -> Vec<String> {
        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size < self.offset {
            self.offset = size;
            return Vec::new();
        }
        if size == self.offset {
            return Vec::new();
        }
        let Ok(mut file) = std::fs::File::open(&self.path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.offset)).is_err() {
            return Vec::new();
        }
        let mut chunk = Vec::new();
        if file.read_to_end(&mut chunk).is_err() {
            return Vec::new();
        }

        let mut lines = Vec::new();
        let mut consumed = 0usize;
        while let Some(newline) = chunk[consumed..].iter().position(|&b| b == b'\n') {
            let line = &chunk[consumed..consumed + newline];
            consumed += newline + 1;
            let text = String::from_utf8_lossy(line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        self.offset += consumed as u64;
        lines
    }

    /// Like `poll_lines`, parsed into events (malformed lines skipped).
    pub fn poll_events(&mut self) -> Vec<Event> {
        self.poll_lines()
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }
}

/// Find one event by id (linear scan; the ledger is the index).
pub fn find_event(path: &Path, event_id: &str) -> Option<Event> {
    let wanted = event_id.trim();
    if wanted.is_empty() {
        return None;
    }
    iter_events(path).into_iter().find(|ev| ev.id == wanted)
}
