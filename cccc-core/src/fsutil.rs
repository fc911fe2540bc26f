//! Atomic filesystem writes.
//!
//! Every multi-reader file in the home directory (registry, cursors, group
//! documents, state snapshots) is written via a tempfile in the target
//! directory followed by a rename, so readers never observe a partial file.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Write `text` to `path` atomically (tempfile in the same directory + rename).
pub fn atomic_write_text(path: &Path, text: &str) -> anyhow::Result<()> {
    atomic_write_bytes(path, text.as_bytes())
}

/// Write raw bytes to `path` atomically.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create directory {}", parent.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to create tempfile in {}", parent.display()))?;
    tmp.write_all(data)
        .with_context(|| format!("failed to write tempfile for {}", path.display()))?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically with a trailing newline.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let mut text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize json for {}", path.display()))?;
    text.push('\n');
    atomic_write_text(path, &text)
}

/// Read and deserialize a JSON document. Missing or malformed files yield the
/// type's default, matching the tolerant-reader contract for state files.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => T::default(),
    }
}

/// Read and deserialize a JSON document, surfacing failures.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
