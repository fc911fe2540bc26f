//! Content-addressed blob store under `state/blobs/`.
//!
//! Attachments are stored as `<sha256>_<sanitized-filename>`; writes are
//! idempotent on the hash. Attachment paths in events are relative and can
//! only resolve back into the blob directory.

use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::fsutil::atomic_write_bytes;
use crate::group::Group;

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9._-]+").expect("blob name regex"))
}

/// Sanitize a filename for storage: strip directories, replace anything
/// outside `[a-zA-Z0-9._-]`, keep the extension usable, cap the length.
pub fn sanitize_filename(name: &str, fallback: &str) -> String {
    let raw = name.trim().replace('\\', "/");
    let base = raw.rsplit('/').next().unwrap_or("").trim();
    if base.is_empty() {
        return fallback.to_string();
    }
    let mut cleaned = unsafe_chars().replace_all(base, "_").to_string();
    if cleaned.is_empty() {
        return fallback.to_string();
    }

    // Names that are only an extension after sanitization (common with
    // non-ASCII originals) get the fallback stem prefixed.
    let path = Path::new(&cleaned);
    let stem = path.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
    let ext = path.extension().map(|s| s.to_string_lossy()).unwrap_or_default();
    let stem_meaningful = stem.chars().any(|c| c.is_ascii_alphanumeric());
    if !ext.is_empty() && !stem_meaningful {
        cleaned = format!("{fallback}.{ext}");
    }
    if !cleaned.chars().any(|c| c.is_ascii_alphanumeric()) {
        return fallback.to_string();
    }
    if cleaned.len() > 120 {
        cleaned.truncate(120);
    }
    cleaned
}

fn detect_kind(mime_type: &str) -> &'static str {
    if mime_type.trim().to_lowercase().starts_with("image/") {
        "image"
    } else {
        "file"
    }
}

/// Store bytes and return the attachment descriptor for the event.
pub fn store_blob_bytes(
    group: &Group,
    data: &[u8],
    filename: &str,
    mime_type: &str,
) -> anyhow::Result<Value> {
    let sha256 = hex::encode(Sha256::digest(data));
    let safe_name = sanitize_filename(filename, "file");
    let blob_name = format!("{sha256}_{safe_name}");

    let rel = PathBuf::from("state").join("blobs").join(&blob_name);
    let abs = group.path.join(&rel);
    if !abs.exists() {
        atomic_write_bytes(&abs, data)?;
    }

    Ok(serde_json::json!({
        "kind": detect_kind(mime_type),
        "path": rel.to_string_lossy(),
        "title": safe_name,
        "mime_type": mime_type,
        "bytes": data.len(),
        "sha256": sha256,
    }))
}

/// Resolve an attachment path to an absolute blob path. Rejects absolute
/// paths, traversal, and anything outside `state/blobs/`.
pub fn resolve_blob_attachment_path(group: &Group, rel_path: &str) -> anyhow::Result<PathBuf> {
    let rel = PathBuf::from(rel_path.trim());
    if rel.as_os_str().is_empty() || rel.is_absolute() {
        anyhow::bail!("invalid attachment path");
    }
    if rel.components().any(|c| matches!(c, Component::ParentDir)) {
        anyhow::bail!("invalid attachment path");
    }
    let mut parts = rel.components();
    let first = parts.next().map(|c| c.as_os_str().to_string_lossy().to_string());
    let second = parts.next().map(|c| c.as_os_str().to_string_lossy().to_string());
    if first.as_deref() != Some("state") || second.as_deref() != Some("blobs") || parts.next().is_none()
    {
        anyhow::bail!("attachment is not a blob");
    }
    Ok(group.path.join(rel))
}
