//! Global settings (`settings.yaml`): the prioritized runtime pool.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fsutil::atomic_write_text;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimePoolEntry {
    pub runtime: String,
    pub priority: u32,
    pub scenarios: Vec<String>,
    pub notes: String,
}

impl Default for RuntimePoolEntry {
    fn default() -> Self {
        Self {
            runtime: String::new(),
            priority: 999,
            scenarios: Vec::new(),
            notes: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub v: u32,
    pub runtime_pool: Vec<RuntimePoolEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        let entry = |runtime: &str, priority: u32, scenarios: &[&str], notes: &str| RuntimePoolEntry {
            runtime: runtime.to_string(),
            priority,
            scenarios: scenarios.iter().map(|s| s.to_string()).collect(),
            notes: notes.to_string(),
        };
        Self {
            v: 1,
            runtime_pool: vec![
                entry("claude", 1, &["coding", "review", "planning", "general"], "Strong coding; MCP support"),
                entry("codex", 2, &["coding", "refactoring", "sandbox"], "Good sandbox support"),
                entry("droid", 3, &["coding", "long-session"], "Robust auto mode"),
                entry("opencode", 4, &["coding"], "Steady long sessions"),
            ],
        }
    }
}

pub fn settings_path(home: &Path) -> std::path::PathBuf {
    home.join("settings.yaml")
}

/// Load settings, falling back to defaults on a missing or malformed file.
pub fn load_settings(home: &Path) -> Settings {
    std::fs::read_to_string(settings_path(home))
        .ok()
        .and_then(|raw| serde_yaml::from_str(&raw).ok())
        .unwrap_or_default()
}

pub fn save_settings(home: &Path, settings: &Settings) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(settings)?;
    atomic_write_text(&settings_path(home), &yaml)
}

/// Runtime pool sorted by priority.
pub fn runtime_pool(settings: &Settings) -> Vec<&RuntimePoolEntry> {
    let mut pool: Vec<&RuntimePoolEntry> = settings.runtime_pool.iter().collect();
    pool.sort_by_key(|e| e.priority);
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_file_missing_or_bad() {
        let home = tempfile::tempdir().unwrap();
        let settings = load_settings(home.path());
        assert_eq!(runtime_pool(&settings)[0].runtime, "claude");

        std::fs::write(settings_path(home.path()), ": not yaml [").unwrap();
        let settings = load_settings(home.path());
        assert_eq!(settings.runtime_pool.len(), 4);
    }

    #[test]
    fn round_trips_through_yaml() {
        let home = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.runtime_pool[0].priority = 9;
        save_settings(home.path(), &settings).unwrap();
        let back = load_settings(home.path());
        assert_eq!(back.runtime_pool[0].priority, 9);
        // Sorting respects the new priority.
        assert_ne!(runtime_pool(&back)[0].runtime, "claude");
    }
}
