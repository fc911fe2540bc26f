//! Global group registry (`registry.json`).
//!
//! Index of every group plus the scope-key → default-group map used by
//! `attach` to find (or create) the group for a project root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::fsutil::{atomic_write_json, read_json_or_default};
use crate::timeutil::utc_now_iso;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupMeta {
    pub group_id: String,
    pub title: String,
    pub topic: String,
    pub path: String,
    pub default_scope_key: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryDoc {
    pub v: u32,
    pub created_at: String,
    pub updated_at: String,
    pub groups: BTreeMap<String, GroupMeta>,
    /// scope_key → group_id defaults.
    pub defaults: BTreeMap<String, String>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        let now = utc_now_iso();
        Self {
            v: 1,
            created_at: now.clone(),
            updated_at: now,
            groups: BTreeMap::new(),
            defaults: BTreeMap::new(),
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    pub path: PathBuf,
    pub doc: RegistryDoc,
}

impl Registry {
    pub fn load(home: &Path) -> anyhow::Result<Self> {
        let path = home.join("registry.json");
        let doc: RegistryDoc = if path.exists() {
            read_json_or_default(&path)
        } else {
            let doc = RegistryDoc::default();
            atomic_write_json(&path, &doc)?;
            doc
        };
        Ok(Self { path, doc })
    }

    pub fn save(&mut self) -> anyhow::Result<()> {
        self.doc.updated_at = utc_now_iso();
        atomic_write_json(&self.path, &self.doc)
    }

    pub fn default_group_for_scope(&self, scope_key: &str) -> Option<&str> {
        self.doc
            .defaults
            .get(scope_key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn set_default_group_for_scope(
        &mut self,
        scope_key: &str,
        group_id: &str,
    ) -> anyhow::Result<()> {
        self.doc
            .defaults
            .insert(scope_key.to_string(), group_id.to_string());
        self.save()
    }

    /// Remove a group from the index and drop any defaults pointing at it.
    pub fn remove_group(&mut self, group_id: &str) -> anyhow::Result<()> {
        self.doc.groups.remove(group_id);
        self.doc.defaults.retain(|_, gid| gid != group_id);
        self.save()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_creates_registry_on_first_use() {
        let home = tempfile::tempdir().unwrap();
        let reg = Registry::load(home.path()).unwrap();
        assert!(reg.path.exists());
        assert!(reg.doc.groups.is_empty());
    }

    #[test]
    fn defaults_round_trip_through_disk() {
        let home = tempfile::tempdir().unwrap();
        {
            let mut reg = Registry::load(home.path()).unwrap();
            reg.set_default_group_for_scope("s_abc", "g_123").unwrap();
        }
        let reg = Registry::load(home.path()).unwrap();
        assert_eq!(reg.default_group_for_scope("s_abc"), Some("g_123"));
        assert_eq!(reg.default_group_for_scope("s_other"), None);
    }

    #[test]
    fn remove_group_clears_defaults() {
        let home = tempfile::tempdir().unwrap();
        let mut reg = Registry::load(home.path()).unwrap();
        reg.doc.groups.insert(
            "g_1".to_string(),
            GroupMeta {
                group_id: "g_1".to_string(),
                ..Default::default()
            },
        );
        reg.set_default_group_for_scope("s_a", "g_1").unwrap();
        reg.remove_group("g_1").unwrap();
        assert!(reg.doc.groups.is_empty());
        assert!(reg.doc.defaults.is_empty());
    }
}
