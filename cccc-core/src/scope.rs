//! Scope identity: who a project root is.
//!
//! A scope is derived on demand from a filesystem path. When the path sits
//! inside a git repository with an `origin` remote, the scope key hashes the
//! normalized https form of that remote so clones of the same project share
//! an identity; otherwise it hashes the resolved path.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeIdentity {
    pub url: String,
    pub scope_key: String,
    pub label: String,
    #[serde(default)]
    pub git_remote: String,
}

fn hash_key(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    format!("s_{}", &hex::encode(digest)[..12])
}

fn run_git(args: &[&str], cwd: &Path) -> Option<String> {
    let output = Command::new("git").args(args).current_dir(cwd).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() { None } else { Some(text) }
}

fn git_root(path: &Path) -> Option<PathBuf> {
    let out = run_git(&["rev-parse", "--show-toplevel"], path)?;
    Some(PathBuf::from(out))
}

fn git_origin_url(repo_root: &Path) -> Option<String> {
    run_git(&["config", "--get", "remote.origin.url"], repo_root)
}

/// Normalize a git remote to its https form:
/// `git@host:org/repo.git` and `ssh://git@host/org/repo.git` both become
/// `https://host/org/repo`.
pub fn normalize_git_remote(url: &str) -> String {
    let u = url.trim();
    if u.is_empty() {
        return String::new();
    }
    if let Some(rest) = u.strip_prefix("ssh://") {
        let rest = rest.strip_prefix("git@").unwrap_or(rest);
        if let Some((host, path)) = rest.split_once('/') {
            let path = path.strip_suffix(".git").unwrap_or(path);
            return format!("https://{host}/{path}");
        }
        return u.to_string();
    }
    if u.starts_with("http://") || u.starts_with("https://") {
        return u.strip_suffix(".git").unwrap_or(u).to_string();
    }
    // scp-like: user@host:path
    if let Some((userhost, path)) = u.split_once(':') {
        if let Some((_, host)) = userhost.split_once('@') {
            if !path.contains("//") {
                let path = path.strip_suffix(".git").unwrap_or(path);
                return format!("https://{host}/{path}");
            }
        }
    }
    u.to_string()
}

/// Derive the scope identity for a path.
pub fn detect_scope(path: &Path) -> ScopeIdentity {
    let resolved = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let repo_root = git_root(&resolved).unwrap_or_else(|| resolved.clone());
    let remote = git_origin_url(&repo_root)
        .map(|raw| normalize_git_remote(&raw))
        .unwrap_or_default();

    let url = repo_root.to_string_lossy().to_string();
    let label = repo_root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "scope".to_string());

    if remote.is_empty() {
        ScopeIdentity {
            scope_key: hash_key(&url),
            url,
            label,
            git_remote: String::new(),
        }
    } else {
        ScopeIdentity {
            scope_key: hash_key(&remote),
            url,
            label,
            git_remote: remote,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scp_like_remote_normalizes_to_https() {
        assert_eq!(
            normalize_git_remote("git@github.com:acme/widgets.git"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn ssh_scheme_normalizes_to_https() {
        assert_eq!(
            normalize_git_remote("ssh://git@github.com/acme/widgets.git"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn https_remote_only_loses_git_suffix() {
        assert_eq!(
            normalize_git_remote("https://github.com/acme/widgets.git"),
            "https://github.com/acme/widgets"
        );
        assert_eq!(
            normalize_git_remote("https://github.com/acme/widgets"),
            "https://github.com/acme/widgets"
        );
    }

    #[test]
    fn plain_directory_hashes_its_path() {
        let dir = tempfile::tempdir().unwrap();
        let scope = detect_scope(dir.path());
        assert!(scope.scope_key.starts_with("s_"));
        assert_eq!(scope.scope_key.len(), 14);
        assert!(scope.git_remote.is_empty());
        // Same path, same identity.
        assert_eq!(detect_scope(dir.path()).scope_key, scope.scope_key);
    }

    #[test]
    fn label_is_directory_basename() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("myproject");
        std::fs::create_dir_all(&sub).unwrap();
        let scope = detect_scope(&sub);
        assert_eq!(scope.label, "myproject");
    }
}
