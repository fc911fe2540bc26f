//! Currently active group (`active.json`) — a UI hint, nothing more.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::fsutil::{atomic_write_json, read_json_or_default};
use crate::timeutil::utc_now_iso;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveDoc {
    pub v: u32,
    pub active_group_id: String,
    pub updated_at: String,
}

fn active_path(home: &Path) -> std::path::PathBuf {
    home.join("active.json")
}

pub fn load_active(home: &Path) -> ActiveDoc {
    read_json_or_default(&active_path(home))
}

pub fn set_active_group_id(home: &Path, group_id: &str) -> anyhow::Result<ActiveDoc> {
    let doc = ActiveDoc {
        v: 1,
        active_group_id: group_id.trim().to_string(),
        updated_at: utc_now_iso(),
    };
    atomic_write_json(&active_path(home), &doc)?;
    Ok(doc)
}
