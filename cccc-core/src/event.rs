//! Ledger event envelope and per-kind payload validation.
//!
//! Known event kinds get a strict shape check on append (unknown fields are
//! rejected, defaults are filled in); unknown kinds pass through untouched so
//! newer writers can extend the ledger without breaking older daemons.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timeutil::utc_now_iso;

/// One line in `ledger.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "default_version")]
    pub v: u32,
    pub id: String,
    pub ts: String,
    pub kind: String,
    pub group_id: String,
    #[serde(default)]
    pub scope_key: String,
    #[serde(default)]
    pub by: String,
    #[serde(default)]
    pub data: Value,
}

fn default_version() -> u32 {
    1
}

impl Event {
    pub fn new(kind: &str, group_id: &str, scope_key: &str, by: &str, data: Value) -> Self {
        Self {
            v: 1,
            id: uuid::Uuid::new_v4().simple().to_string(),
            ts: utc_now_iso(),
            kind: kind.to_string(),
            group_id: group_id.to_string(),
            scope_key: scope_key.to_string(),
            by: by.to_string(),
            data,
        }
    }
}

// --- per-kind payload models -------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupCreateData {
    pub title: String,
    #[serde(default)]
    pub topic: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupUpdatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupUpdateData {
    pub patch: GroupUpdatePatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupAttachData {
    pub url: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub git_remote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupDetachScopeData {
    pub scope_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSetActiveScopeData {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupSetStateData {
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupStartData {
    #[serde(default)]
    pub started: Vec<String>,
    /// Actors forced from pty to headless because the platform has no pty.
    #[serde(default)]
    pub forced_headless: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupStopData {
    #[serde(default)]
    pub stopped: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorAddData {
    pub actor: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorUpdateData {
    pub actor_id: String,
    pub patch: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorLifecycleData {
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_effective: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextSyncData {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub changes: Vec<Value>,
}

/// IM-style chat message payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatMessageData {
    pub text: String,
    #[serde(default = "default_format")]
    pub format: String,
    /// Recipient tokens; empty means the group default send policy applies.
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_text: Option<String>,
    #[serde(default)]
    pub refs: Vec<Value>,
    #[serde(default)]
    pub attachments: Vec<Value>,
    #[serde(default)]
    pub thread: String,
    /// Client-provided idempotency id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

fn default_format() -> String {
    "plain".to_string()
}

impl ChatMessageData {
    pub fn plain(text: impl Into<String>, to: Vec<String>) -> Self {
        Self {
            text: text.into(),
            format: default_format(),
            to,
            reply_to: None,
            quote_text: None,
            refs: Vec::new(),
            attachments: Vec::new(),
            thread: String::new(),
            client_id: None,
        }
    }
}

/// Read receipt: an actor marks messages read up to a given event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatReadData {
    pub actor_id: String,
    pub event_id: String,
}

/// Per-message, per-recipient acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatAckData {
    pub actor_id: String,
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatReactionData {
    pub event_id: String,
    pub actor_id: String,
    pub emoji: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemNotifyData {
    pub kind: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_actor_id: Option<String>,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_event_id: Option<String>,
}

fn default_priority() -> String {
    "normal".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyAckData {
    pub notify_event_id: String,
    pub actor_id: String,
}

// --- validation --------------------------------------------------------------

/// Normalize event data for a given kind: strict-parse known kinds (filling
/// defaults, rejecting unknown fields), pass unknown kinds through unchanged.
pub fn normalize_event_data(kind: &str, data: Value) -> anyhow::Result<Value> {
    let data = if data.is_null() {
        Value::Object(Default::default())
    } else {
        data
    };

    fn reserialize<T: serde::de::DeserializeOwned + Serialize>(
        kind: &str,
        data: Value,
    ) -> anyhow::Result<Value> {
        let parsed: T = serde_json::from_value(data)
            .map_err(|e| anyhow::anyhow!("invalid {kind} data: {e}"))?;
        Ok(serde_json::to_value(parsed)?)
    }

    match kind {
        "group.create" => reserialize::<GroupCreateData>(kind, data),
        "group.update" => {
            let out = reserialize::<GroupUpdateData>(kind, data)?;
            let patch = &out["patch"];
            if patch.get("title").is_none() && patch.get("topic").is_none() {
                anyhow::bail!("group.update patch must include title and/or topic");
            }
            Ok(out)
        }
        "group.attach" => reserialize::<GroupAttachData>(kind, data),
        "group.detach_scope" => reserialize::<GroupDetachScopeData>(kind, data),
        "group.set_active_scope" => reserialize::<GroupSetActiveScopeData>(kind, data),
        "group.set_state" => reserialize::<GroupSetStateData>(kind, data),
        "group.start" => reserialize::<GroupStartData>(kind, data),
        "group.stop" => reserialize::<GroupStopData>(kind, data),
        "actor.add" => reserialize::<ActorAddData>(kind, data),
        "actor.update" => {
            let out = reserialize::<ActorUpdateData>(kind, data)?;
            if out["patch"].as_object().is_some_and(|p| p.is_empty()) {
                anyhow::bail!("actor.update patch cannot be empty");
            }
            Ok(out)
        }
        "actor.start" | "actor.stop" | "actor.restart" | "actor.remove" => {
            reserialize::<ActorLifecycleData>(kind, data)
        }
        "context.sync" => reserialize::<ContextSyncData>(kind, data),
        "chat.message" => reserialize::<ChatMessageData>(kind, data),
        "chat.read" => reserialize::<ChatReadData>(kind, data),
        "chat.ack" => reserialize::<ChatAckData>(kind, data),
        "chat.reaction" => reserialize::<ChatReactionData>(kind, data),
        "system.notify" => reserialize::<SystemNotifyData>(kind, data),
        "system.notify_ack" => reserialize::<NotifyAckData>(kind, data),
        _ => Ok(data),
    }
}
