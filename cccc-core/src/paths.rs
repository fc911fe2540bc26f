//! Home-directory resolution for CCCC state.
//!
//! Everything the daemon owns lives under one root (`~/.cccc` by default,
//! overridable via `CCCC_HOME`).

use std::path::{Path, PathBuf};

/// Resolve the CCCC home root without creating it.
pub fn cccc_home() -> PathBuf {
    if let Ok(env) = std::env::var("CCCC_HOME") {
        let trimmed = env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }
    home_dir().join(".cccc")
}

/// Resolve the CCCC home root and make sure it exists on disk.
pub fn ensure_home() -> std::io::Result<PathBuf> {
    let home = cccc_home();
    std::fs::create_dir_all(&home)?;
    Ok(home)
}

pub fn daemon_dir(home: &Path) -> PathBuf {
    home.join("daemon")
}

pub fn socket_path(home: &Path) -> PathBuf {
    daemon_dir(home).join("ccccd.sock")
}

pub fn pid_path(home: &Path) -> PathBuf {
    daemon_dir(home).join("ccccd.pid")
}

pub fn groups_dir(home: &Path) -> PathBuf {
    home.join("groups")
}

pub fn group_dir(home: &Path, group_id: &str) -> PathBuf {
    groups_dir(home).join(group_id)
}

fn home_dir() -> PathBuf {
    #[allow(deprecated)]
    std::env::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_wins() {
        // Serialize access to the process env var with a local guard value.
        let prev = std::env::var("CCCC_HOME").ok();
        unsafe { std::env::set_var("CCCC_HOME", "/tmp/cccc-test-home") };
        assert_eq!(cccc_home(), PathBuf::from("/tmp/cccc-test-home"));
        match prev {
            Some(v) => unsafe { std::env::set_var("CCCC_HOME", v) },
            None => unsafe { std::env::remove_var("CCCC_HOME") },
        }
    }

    #[test]
    fn layout_paths_are_nested_under_home() {
        let home = PathBuf::from("/srv/cccc");
        assert_eq!(socket_path(&home), home.join("daemon/ccccd.sock"));
        assert_eq!(pid_path(&home), home.join("daemon/ccccd.pid"));
        assert_eq!(group_dir(&home, "g_abc"), home.join("groups/g_abc"));
    }
}
