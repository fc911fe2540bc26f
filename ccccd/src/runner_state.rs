//! PTY runner state sidecars (`state/runners/pty/<aid>.json`).
//!
//! Each spawned session writes a sidecar with its pid so a daemon that
//! crashed without stopping its children can reap the orphans on the next
//! startup. Sidecars are deleted on clean exit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use cccc_core::fsutil::{atomic_write_json, read_json_or_default};
use cccc_core::timeutil::utc_now_iso;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerState {
    pub v: u32,
    pub kind: String,
    pub group_id: String,
    pub actor_id: String,
    pub pid: u32,
    pub started_at: String,
}

pub fn pty_state_path(home: &Path, group_id: &str, actor_id: &str) -> PathBuf {
    cccc_core::paths::group_dir(home, group_id)
        .join("state")
        .join("runners")
        .join("pty")
        .join(format!("{actor_id}.json"))
}

pub fn write_pty_state(home: &Path, group_id: &str, actor_id: &str, pid: u32) {
    let state = RunnerState {
        v: 1,
        kind: "pty".to_string(),
        group_id: group_id.to_string(),
        actor_id: actor_id.to_string(),
        pid,
        started_at: utc_now_iso(),
    };
    if let Err(e) = atomic_write_json(&pty_state_path(home, group_id, actor_id), &state) {
        warn!(err = %e, group_id, actor_id, "failed to write runner state");
    }
}

/// Remove the sidecar, but only when it still refers to `pid` (0 = any).
pub fn remove_pty_state_if_pid(home: &Path, group_id: &str, actor_id: &str, pid: u32) {
    let path = pty_state_path(home, group_id, actor_id);
    if !path.exists() {
        return;
    }
    let state: RunnerState = read_json_or_default(&path);
    if state.pid != 0 && pid != 0 && state.pid != pid {
        return;
    }
    let _ = std::fs::remove_file(&path);
}

/// Remove every sidecar for a group (used by `group_stop`).
pub fn clear_group_pty_state(home: &Path, group_id: &str) {
    let dir = cccc_core::paths::group_dir(home, group_id)
        .join("state")
        .join("runners")
        .join("pty");
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.path().extension().is_some_and(|e| e == "json") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}

fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

fn best_effort_killpg(pid: u32, sig: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        if libc::killpg(pid as i32, sig) != 0 {
            let _ = libc::kill(pid as i32, sig);
        }
    }
}

/// Reap orphaned actor processes left behind by a crashed daemon, removing
/// their sidecars. Best effort throughout.
pub fn cleanup_stale_pty_state(home: &Path) {
    let base = cccc_core::paths::groups_dir(home);
    let Ok(groups) = std::fs::read_dir(&base) else {
        return;
    };
    for group in groups.flatten() {
        let dir = group.path().join("state").join("runners").join("pty");
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "json") {
                continue;
            }
            let state: RunnerState = read_json_or_default(&path);
            if state.kind != "pty" || !pid_alive(state.pid) {
                let _ = std::fs::remove_file(&path);
                continue;
            }
            info!(pid = state.pid, actor_id = %state.actor_id, "reaping orphaned pty actor");
            best_effort_killpg(state.pid, libc::SIGTERM);
            let deadline = std::time::Instant::now() + Duration::from_secs(1);
            while std::time::Instant::now() < deadline && pid_alive(state.pid) {
                std::thread::sleep(Duration::from_millis(50));
            }
            if pid_alive(state.pid) {
                best_effort_killpg(state.pid, libc::SIGKILL);
            }
            let _ = std::fs::remove_file(&path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_round_trip_and_pid_guard() {
        let home = tempfile::tempdir().unwrap();
        write_pty_state(home.path(), "g_1", "peer-a", 4242);
        let path = pty_state_path(home.path(), "g_1", "peer-a");
        assert!(path.exists());
        let state: RunnerState = read_json_or_default(&path);
        assert_eq!(state.pid, 4242);
        assert_eq!(state.kind, "pty");

        // A different live pid is left alone.
        remove_pty_state_if_pid(home.path(), "g_1", "peer-a", 9999);
        assert!(path.exists());
        remove_pty_state_if_pid(home.path(), "g_1", "peer-a", 4242);
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_removes_dead_pid_sidecars() {
        let home = tempfile::tempdir().unwrap();
        // A pid that is almost certainly not alive.
        write_pty_state(home.path(), "g_1", "ghost", 999_999_999);
        cleanup_stale_pty_state(home.path());
        assert!(!pty_state_path(home.path(), "g_1", "ghost").exists());
    }

    #[test]
    fn clear_group_removes_all_sidecars() {
        let home = tempfile::tempdir().unwrap();
        write_pty_state(home.path(), "g_1", "a", 1);
        write_pty_state(home.path(), "g_1", "b", 2);
        clear_group_pty_state(home.path(), "g_1");
        assert!(!pty_state_path(home.path(), "g_1", "a").exists());
        assert!(!pty_state_path(home.path(), "g_1", "b").exists());
    }
}
