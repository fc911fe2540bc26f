//! Group documents (`groups/<gid>/group.yaml`).
//!
//! A group is a working set of actors plus one or more attached scopes,
//! sharing a ledger. The document is rewritten atomically on every mutation
//! with a bumped `updated_at`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::actor::Actor;
use crate::fsutil::atomic_write_text;
use crate::registry::{GroupMeta, Registry};
use crate::scope::ScopeIdentity;
use crate::timeutil::utc_now_iso;

/// Desired delivery/automation knobs, all overridable per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub nudge_after_seconds: u64,
    pub self_check_every_handoffs: u64,
    pub system_refresh_every_self_checks: u64,
    pub keepalive_delay_seconds: u64,
    pub ack_timeout_seconds: u64,
    pub resend_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            nudge_after_seconds: 300,
            self_check_every_handoffs: 6,
            system_refresh_every_self_checks: 3,
            keepalive_delay_seconds: 60,
            ack_timeout_seconds: 30,
            resend_attempts: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerRetentionConfig {
    pub max_active_bytes: u64,
    pub keep_tail_lines: usize,
    pub min_interval_seconds: u64,
}

impl Default for LedgerRetentionConfig {
    fn default() -> Self {
        Self {
            max_active_bytes: 50_000_000,
            keep_tail_lines: 2000,
            min_interval_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Policy for sends with an empty `to`: "foreman" or "broadcast".
    pub default_send_to: String,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_send_to: "foreman".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRecord {
    pub scope_key: String,
    pub url: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub git_remote: String,
}

impl From<&ScopeIdentity> for ScopeRecord {
    fn from(scope: &ScopeIdentity) -> Self {
        Self {
            scope_key: scope.scope_key.clone(),
            url: scope.url.clone(),
            label: scope.label.clone(),
            git_remote: scope.git_remote.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupDoc {
    pub v: u32,
    pub group_id: String,
    pub title: String,
    pub topic: String,
    pub created_at: String,
    pub updated_at: String,
    /// Desired run-state for the actor processes.
    pub running: bool,
    /// Delivery state: "active" or "paused". Pausing suppresses PTY delivery
    /// and automation without stopping processes.
    pub state: String,
    pub active_scope_key: String,
    pub scopes: Vec<ScopeRecord>,
    pub actors: Vec<Actor>,
    pub delivery: DeliveryConfig,
    pub automation: Value,
    pub messaging: MessagingConfig,
    pub terminal_transcript: Value,
    pub ledger: LedgerRetentionConfig,
    /// IM bridge configuration (platform, token env names). Opaque to the
    /// daemon; owned by the bridge.
    pub im: Value,
}

impl Default for GroupDoc {
    fn default() -> Self {
        Self {
            v: 1,
            group_id: String::new(),
            title: String::new(),
            topic: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
            running: false,
            state: "active".to_string(),
            active_scope_key: String::new(),
            scopes: Vec::new(),
            actors: Vec::new(),
            delivery: DeliveryConfig::default(),
            automation: Value::Object(Default::default()),
            messaging: MessagingConfig::default(),
            terminal_transcript: Value::Object(Default::default()),
            ledger: LedgerRetentionConfig::default(),
            im: Value::Object(Default::default()),
        }
    }
}

impl GroupDoc {
    pub fn is_paused(&self) -> bool {
        self.state.trim() == "paused"
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub group_id: String,
    pub path: PathBuf,
    pub doc: GroupDoc,
}

impl Group {
    pub fn ledger_path(&self) -> PathBuf {
        self.path.join("ledger.jsonl")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path.join("state")
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        self.doc.updated_at = utc_now_iso();
        let yaml = serde_yaml::to_string(&self.doc)?;
        atomic_write_text(&self.path.join("group.yaml"), &yaml)
    }

    pub fn scope_url(&self, scope_key: &str) -> Option<&str> {
        let wanted = scope_key.trim();
        if wanted.is_empty() {
            return None;
        }
        self.doc
            .scopes
            .iter()
            .find(|s| s.scope_key == wanted)
            .map(|s| s.url.as_str())
    }

    pub fn has_scope(&self, scope_key: &str) -> bool {
        self.scope_url(scope_key).is_some()
    }
}

fn seeded_group_id(seed: &str) -> String {
    let digest = Sha256::digest(seed.as_bytes());
    format!("g_{}", &hex::encode(digest)[..12])
}

fn random_group_id() -> String {
    format!("g_{}", &uuid::Uuid::new_v4().simple().to_string()[..12])
}

fn init_group_dirs(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path.join("context"))?;
    std::fs::create_dir_all(path.join("scopes"))?;
    std::fs::create_dir_all(path.join("state"))?;
    if !path.join("ledger.jsonl").exists() {
        std::fs::write(path.join("ledger.jsonl"), b"")?;
    }
    Ok(())
}

pub fn load_group(home: &Path, group_id: &str) -> Option<Group> {
    let gid = group_id.trim();
    if gid.is_empty() {
        return None;
    }
    let path = crate::paths::group_dir(home, gid);
    let raw = std::fs::read_to_string(path.join("group.yaml")).ok()?;
    let doc: GroupDoc = serde_yaml::from_str(&raw).ok()?;
    Some(Group {
        group_id: gid.to_string(),
        path,
        doc,
    })
}

fn write_new_group(
    home: &Path,
    reg: &mut Registry,
    group_id: &str,
    title: &str,
    topic: &str,
) -> anyhow::Result<Group> {
    let path = crate::paths::group_dir(home, group_id);
    init_group_dirs(&path)?;

    let now = utc_now_iso();
    let title = if title.trim().is_empty() {
        "working-group".to_string()
    } else {
        title.trim().to_string()
    };
    let doc = GroupDoc {
        group_id: group_id.to_string(),
        title: title.clone(),
        topic: topic.trim().to_string(),
        created_at: now.clone(),
        updated_at: now.clone(),
        ..Default::default()
    };
    let mut group = Group {
        group_id: group_id.to_string(),
        path: path.clone(),
        doc,
    };
    group.save()?;

    reg.doc.groups.insert(
        group_id.to_string(),
        GroupMeta {
            group_id: group_id.to_string(),
            title,
            topic: topic.trim().to_string(),
            path: path.to_string_lossy().to_string(),
            default_scope_key: String::new(),
            created_at: now.clone(),
            updated_at: now,
        },
    );
    reg.save()?;
    Ok(group)
}

pub fn create_group(
    home: &Path,
    reg: &mut Registry,
    title: &str,
    topic: &str,
) -> anyhow::Result<Group> {
    write_new_group(home, reg, &random_group_id(), title, topic)
}

/// Attach a scope: add (or refresh) its record, mirror `scope.yaml` into the
/// group, optionally set it active, and register the scope default.
pub fn attach_scope_to_group(
    reg: &mut Registry,
    group: &mut Group,
    scope: &ScopeIdentity,
    set_active: bool,
) -> anyhow::Result<()> {
    let now = utc_now_iso();

    match group
        .doc
        .scopes
        .iter_mut()
        .find(|s| s.scope_key == scope.scope_key)
    {
        Some(existing) => *existing = ScopeRecord::from(scope),
        None => group.doc.scopes.push(ScopeRecord::from(scope)),
    }

    // Mirror into groups/<gid>/scopes/<key>/scope.yaml, preserving created_at.
    let scope_dir = group.path.join("scopes").join(&scope.scope_key);
    std::fs::create_dir_all(&scope_dir)?;
    let scope_yaml = scope_dir.join("scope.yaml");
    let created_at = std::fs::read_to_string(&scope_yaml)
        .ok()
        .and_then(|raw| serde_yaml::from_str::<serde_yaml::Value>(&raw).ok())
        .and_then(|doc| doc.get("created_at").and_then(|v| v.as_str().map(String::from)))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| now.clone());
    let scope_doc = serde_json::json!({
        "v": 1,
        "scope_key": scope.scope_key,
        "url": scope.url,
        "label": scope.label,
        "git_remote": scope.git_remote,
        "created_at": created_at,
        "updated_at": now,
    });
    atomic_write_text(&scope_yaml, &serde_yaml::to_string(&scope_doc)?)?;

    if set_active || group.doc.active_scope_key.trim().is_empty() {
        group.doc.active_scope_key = scope.scope_key.clone();
    }
    group.save()?;

    reg.doc
        .defaults
        .insert(scope.scope_key.clone(), group.group_id.clone());
    if let Some(meta) = reg.doc.groups.get_mut(&group.group_id) {
        meta.title = group.doc.title.clone();
        meta.default_scope_key = group.doc.active_scope_key.clone();
        meta.updated_at = now;
    }
    reg.save()?;
    Ok(())
}

/// Set the active scope; the scope must already be attached.
pub fn set_active_scope(
    reg: &mut Registry,
    group: &mut Group,
    scope_key: &str,
) -> anyhow::Result<()> {
    let wanted = scope_key.trim();
    if wanted.is_empty() {
        anyhow::bail!("missing scope_key");
    }
    if !group.has_scope(wanted) {
        anyhow::bail!("scope not attached: {wanted}");
    }
    group.doc.active_scope_key = wanted.to_string();
    group.save()?;

    if let Some(meta) = reg.doc.groups.get_mut(&group.group_id) {
        meta.default_scope_key = wanted.to_string();
        meta.updated_at = group.doc.updated_at.clone();
    }
    reg.save()?;
    Ok(())
}

/// Find (or create) the group for a scope, keyed by the scope default in the
/// registry, falling back to a deterministic id derived from the git remote
/// (or path). The scope ends up attached and active.
pub fn ensure_group_for_scope(
    home: &Path,
    reg: &mut Registry,
    scope: &ScopeIdentity,
) -> anyhow::Result<Group> {
    if let Some(gid) = reg.default_group_for_scope(&scope.scope_key).map(String::from) {
        if let Some(mut group) = load_group(home, &gid) {
            attach_scope_to_group(reg, &mut group, scope, true)?;
            return Ok(group);
        }
    }

    let seed = if scope.git_remote.is_empty() {
        &scope.url
    } else {
        &scope.git_remote
    };
    let group_id = seeded_group_id(seed);
    let mut group = match load_group(home, &group_id) {
        Some(group) => group,
        None => write_new_group(home, reg, &group_id, &scope.label, "")?,
    };
    attach_scope_to_group(reg, &mut group, scope, true)?;
    Ok(group)
}

/// Apply a title/topic patch.
pub fn update_group(
    reg: &mut Registry,
    group: &mut Group,
    title: Option<&str>,
    topic: Option<&str>,
) -> anyhow::Result<()> {
    if let Some(title) = title {
        let t = title.trim();
        if !t.is_empty() {
            group.doc.title = t.to_string();
        }
    }
    if let Some(topic) = topic {
        group.doc.topic = topic.trim().to_string();
    }
    group.save()?;

    if let Some(meta) = reg.doc.groups.get_mut(&group.group_id) {
        meta.title = group.doc.title.clone();
        meta.topic = group.doc.topic.clone();
        meta.updated_at = group.doc.updated_at.clone();
    }
    reg.save()?;
    Ok(())
}

/// Detach a scope. If it was active, the first remaining scope (if any)
/// becomes active. The mirrored scope directory and the registry default are
/// removed.
pub fn detach_scope_from_group(
    reg: &mut Registry,
    group: &mut Group,
    scope_key: &str,
) -> anyhow::Result<()> {
    let wanted = scope_key.trim();
    if wanted.is_empty() {
        anyhow::bail!("missing scope_key");
    }
    let before = group.doc.scopes.len();
    group.doc.scopes.retain(|s| s.scope_key != wanted);
    if group.doc.scopes.len() == before {
        anyhow::bail!("scope not attached: {wanted}");
    }

    if group.doc.active_scope_key == wanted {
        group.doc.active_scope_key = group
            .doc
            .scopes
            .first()
            .map(|s| s.scope_key.clone())
            .unwrap_or_default();
    }
    let _ = std::fs::remove_dir_all(group.path.join("scopes").join(wanted));

    if reg.doc.defaults.get(wanted).map(String::as_str) == Some(group.group_id.as_str()) {
        reg.doc.defaults.remove(wanted);
    }
    group.save()?;

    if let Some(meta) = reg.doc.groups.get_mut(&group.group_id) {
        meta.default_scope_key = group.doc.active_scope_key.clone();
        meta.updated_at = group.doc.updated_at.clone();
    }
    reg.save()?;
    Ok(())
}

/// Remove the group directory recursively and drop it from the registry.
pub fn delete_group(home: &Path, reg: &mut Registry, group_id: &str) -> anyhow::Result<()> {
    let gid = group_id.trim();
    if gid.is_empty() {
        anyhow::bail!("missing group_id");
    }
    let path = crate::paths::group_dir(home, gid);
    if path.exists() {
        std::fs::remove_dir_all(&path)?;
    }
    reg.remove_group(gid)
}
