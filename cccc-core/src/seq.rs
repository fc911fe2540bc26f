//! Per-peer monotonic sequence counters.
//!
//! External delivery channels (IM inbound, legacy mailbox inboxes) need a
//! strictly increasing, gap-free sequence per peer that survives daemon
//! restarts and concurrent writers. One counter file per peer holds the last
//! issued integer; an adjacent lock file serializes the read-modify-write.
//! If the counter file is missing, the counter recovers from the highest
//! 6-digit prefix among existing files in the given directories.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::lock;

pub fn counter_path(state_dir: &Path, peer: &str) -> PathBuf {
    state_dir.join(format!("inbox-seq-{peer}.txt"))
}

fn lock_path(state_dir: &Path, peer: &str) -> PathBuf {
    state_dir.join(format!("inbox-seq-{peer}.lock"))
}

fn max_seq_in(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.get(..6)?.parse::<u64>().ok()
        })
        .max()
        .unwrap_or(0)
}

/// Issue the next sequence number for `peer`, formatted `%06d`.
///
/// `scan_dirs` are consulted only when the counter file does not exist yet
/// (recovery after manual cleanup). The new value is fsynced before the lock
/// is released, so a crash cannot reissue it.
pub fn next_seq(state_dir: &Path, peer: &str, scan_dirs: &[&Path]) -> anyhow::Result<String> {
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("failed to create {}", state_dir.display()))?;
    let counter = counter_path(state_dir, peer);

    let _guard = lock::acquire_exclusive(&lock_path(state_dir, peer))?;

    let current = match std::fs::read_to_string(&counter) {
        Ok(raw) => raw.trim().parse::<u64>().unwrap_or(0),
        Err(_) => scan_dirs.iter().map(|d| max_seq_in(d)).max().unwrap_or(0),
    };
    let next = current + 1;

    // Plain write + fsync under the lock; the lock is the atomicity boundary.
    let mut file = std::fs::File::create(&counter)
        .with_context(|| format!("failed to write {}", counter.display()))?;
    file.write_all(next.to_string().as_bytes())?;
    file.sync_all()?;

    Ok(format!("{next:06}"))
}
