//! Portable group templates.
//!
//! A template is a single YAML document carrying a group's actor roster and
//! the settings that are safe to move between projects. Environment maps are
//! deliberately excluded (templates never carry secrets), as are scopes
//! (they are machine-local identities).

use serde::{Deserialize, Serialize};

use crate::actor::{Actor, ActorSubmit, RunnerKind};
use crate::group::Group;
use crate::timeutil::utc_now_iso;
use crate::transcript::get_transcript_settings;

pub const TEMPLATE_KIND: &str = "cccc.group_template";

fn default_kind() -> String {
    TEMPLATE_KIND.to_string()
}

/// Command field accepts either a list or a whitespace-split string.
fn deserialize_command<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<String>),
        Text(String),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::List(list) => list
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Raw::Text(text) => text.split_whitespace().map(String::from).collect(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupTemplateActor {
    #[serde(rename = "id")]
    pub actor_id: String,
    pub title: String,
    pub runtime: String,
    pub runner: RunnerKind,
    #[serde(deserialize_with = "deserialize_command")]
    pub command: Vec<String>,
    pub submit: ActorSubmit,
    pub enabled: bool,
}

impl Default for GroupTemplateActor {
    fn default() -> Self {
        Self {
            actor_id: String::new(),
            title: String::new(),
            runtime: "codex".to_string(),
            runner: RunnerKind::Pty,
            command: Vec::new(),
            submit: ActorSubmit::Enter,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupTemplateSettings {
    pub default_send_to: String,
    pub nudge_after_seconds: u64,
    pub self_check_every_handoffs: u64,
    pub system_refresh_every_self_checks: u64,
    pub keepalive_delay_seconds: u64,
    pub ack_timeout_seconds: u64,
    pub resend_attempts: u32,
    pub terminal_transcript_visibility: String,
    pub terminal_transcript_notify_tail: bool,
    pub terminal_transcript_notify_lines: u32,
}

impl Default for GroupTemplateSettings {
    fn default() -> Self {
        let delivery = crate::group::DeliveryConfig::default();
        let transcript = crate::transcript::TranscriptSettings::default();
        Self {
            default_send_to: "foreman".to_string(),
            nudge_after_seconds: delivery.nudge_after_seconds,
            self_check_every_handoffs: delivery.self_check_every_handoffs,
            system_refresh_every_self_checks: delivery.system_refresh_every_self_checks,
            keepalive_delay_seconds: delivery.keepalive_delay_seconds,
            ack_timeout_seconds: delivery.ack_timeout_seconds,
            resend_attempts: delivery.resend_attempts,
            terminal_transcript_visibility: transcript.visibility,
            terminal_transcript_notify_tail: transcript.notify_tail,
            terminal_transcript_notify_lines: transcript.notify_lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupTemplate {
    pub kind: String,
    pub v: u32,
    /// Informational; not applied on import.
    pub title: String,
    pub topic: String,
    pub exported_at: String,
    pub cccc_version: String,
    pub actors: Vec<GroupTemplateActor>,
    pub settings: GroupTemplateSettings,
}

impl Default for GroupTemplate {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            v: 1,
            title: String::new(),
            topic: String::new(),
            exported_at: String::new(),
            cccc_version: String::new(),
            actors: Vec::new(),
            settings: GroupTemplateSettings::default(),
        }
    }
}

pub fn parse_group_template(text: &str) -> anyhow::Result<GroupTemplate> {
    let raw = text.trim();
    if raw.is_empty() {
        anyhow::bail!("template is empty");
    }
    let template: GroupTemplate = serde_yaml::from_str(raw)
        .map_err(|e| anyhow::anyhow!("invalid template YAML: {e}"))?;
    if template.kind != TEMPLATE_KIND {
        anyhow::bail!("not a group template (kind: {})", template.kind);
    }
    for actor in &template.actors {
        if actor.actor_id.trim().is_empty() {
            anyhow::bail!("template actor without an id");
        }
    }
    Ok(template)
}

pub fn dump_group_template(template: &GroupTemplate) -> anyhow::Result<String> {
    Ok(serde_yaml::to_string(template)?)
}

pub fn build_group_template_from_group(group: &Group, cccc_version: &str) -> GroupTemplate {
    let transcript = get_transcript_settings(&group.doc.terminal_transcript);
    let delivery = &group.doc.delivery;
    GroupTemplate {
        kind: default_kind(),
        v: 1,
        title: group.doc.title.clone(),
        topic: group.doc.topic.clone(),
        exported_at: utc_now_iso(),
        cccc_version: cccc_version.to_string(),
        actors: group
            .doc
            .actors
            .iter()
            .map(|a| GroupTemplateActor {
                actor_id: a.id.clone(),
                title: a.title.clone(),
                runtime: a.runtime.clone(),
                runner: a.runner,
                command: a.command.clone(),
                submit: a.submit,
                enabled: a.enabled,
            })
            .collect(),
        settings: GroupTemplateSettings {
            default_send_to: group.doc.messaging.default_send_to.clone(),
            nudge_after_seconds: delivery.nudge_after_seconds,
            self_check_every_handoffs: delivery.self_check_every_handoffs,
            system_refresh_every_self_checks: delivery.system_refresh_every_self_checks,
            keepalive_delay_seconds: delivery.keepalive_delay_seconds,
            ack_timeout_seconds: delivery.ack_timeout_seconds,
            resend_attempts: delivery.resend_attempts,
            terminal_transcript_visibility: transcript.visibility,
            terminal_transcript_notify_tail: transcript.notify_tail,
            terminal_transcript_notify_lines: transcript.notify_lines,
        },
    }
}

/// Summary of what applying a template would change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupTemplateDiff {
    pub actors_add: Vec<String>,
    pub actors_update: Vec<String>,
    pub actors_remove: Vec<String>,
    pub settings_changed: Vec<String>,
}

pub fn preview_group_template(group: &Group, template: &GroupTemplate) -> GroupTemplateDiff {
    let current = build_group_template_from_group(group, "");
    let existing_ids: Vec<&str> = current.actors.iter().map(|a| a.actor_id.as_str()).collect();
    let template_ids: Vec<&str> = template.actors.iter().map(|a| a.actor_id.as_str()).collect();

    let actors_add = template_ids
        .iter()
        .filter(|id| !existing_ids.contains(id))
        .map(|s| s.to_string())
        .collect();
    let actors_remove = existing_ids
        .iter()
        .filter(|id| !template_ids.contains(id))
        .map(|s| s.to_string())
        .collect();
    let actors_update = template
        .actors
        .iter()
        .filter_map(|desired| {
            current
                .actors
                .iter()
                .find(|cur| cur.actor_id == desired.actor_id)
                .filter(|cur| *cur != desired)
                .map(|_| desired.actor_id.clone())
        })
        .collect();

    let mut settings_changed = Vec::new();
    let cur = serde_json::to_value(&current.settings).unwrap_or_default();
    let new = serde_json::to_value(&template.settings).unwrap_or_default();
    if let (Some(cur), Some(new)) = (cur.as_object(), new.as_object()) {
        for (key, value) in cur {
            if new.get(key).is_some_and(|n| n != value) {
                settings_changed.push(key.clone());
            }
        }
    }

    GroupTemplateDiff {
        actors_add,
        actors_update,
        actors_remove,
        settings_changed,
    }
}

/// Replace the group's actor roster and settings with the template's.
/// Retained actors keep their env, scope binding, and created_at; the
/// template never touches scopes or the run state.
pub fn apply_group_template(group: &mut Group, template: &GroupTemplate) -> anyhow::Result<()> {
    let now = utc_now_iso();
    let previous: Vec<Actor> = std::mem::take(&mut group.doc.actors);

    group.doc.actors = template
        .actors
        .iter()
        .map(|spec| {
            let prior = previous.iter().find(|a| a.id == spec.actor_id);
            Actor {
                v: 1,
                id: spec.actor_id.clone(),
                title: spec.title.clone(),
                command: spec.command.clone(),
                env: prior.map(|a| a.env.clone()).unwrap_or_default(),
                default_scope_key: prior
                    .map(|a| a.default_scope_key.clone())
                    .unwrap_or_default(),
                submit: spec.submit,
                enabled: spec.enabled,
                runner: spec.runner,
                runtime: spec.runtime.clone(),
                created_at: prior
                    .map(|a| a.created_at.clone())
                    .unwrap_or_else(|| now.clone()),
                updated_at: now.clone(),
            }
        })
        .collect();

    let settings = &template.settings;
    group.doc.messaging.default_send_to = settings.default_send_to.clone();
    group.doc.delivery.nudge_after_seconds = settings.nudge_after_seconds;
    group.doc.delivery.self_check_every_handoffs = settings.self_check_every_handoffs;
    group.doc.delivery.system_refresh_every_self_checks =
        settings.system_refresh_every_self_checks;
    group.doc.delivery.keepalive_delay_seconds = settings.keepalive_delay_seconds;
    group.doc.delivery.ack_timeout_seconds = settings.ack_timeout_seconds;
    group.doc.delivery.resend_attempts = settings.resend_attempts;
    group.doc.terminal_transcript = serde_json::json!({
        "visibility": settings.terminal_transcript_visibility,
        "notify_tail": settings.terminal_transcript_notify_tail,
        "notify_lines": settings.terminal_transcript_notify_lines,
    });

    group.save()
}
