//! Actor records and positional roles.
//!
//! An actor is a runnable agent session inside a group. Roles are never
//! stored: the first enabled actor in list order is the foreman, everyone
//! else is a peer. Reordering the list is how the foreman changes.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{OpError, OpResult};
use crate::group::Group;
use crate::timeutil::utc_now_iso;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Foreman,
    Peer,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorSubmit {
    #[default]
    Enter,
    Newline,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Pty,
    Headless,
}

pub const KNOWN_RUNTIMES: &[&str] = &[
    "amp", "auggie", "claude", "codex", "copilot", "cursor", "droid", "gemini", "kilocode",
    "opencode", "custom",
];

/// Default command (with autonomy flags) for a known runtime.
pub fn runtime_default_command(runtime: &str) -> Vec<String> {
    let cmd: &[&str] = match runtime {
        "claude" => &["claude", "--dangerously-skip-permissions"],
        "codex" => &["codex", "--dangerously-bypass-approvals-and-sandbox"],
        "droid" => &["droid", "--auto", "high"],
        "gemini" => &["gemini", "--yolo"],
        "copilot" => &["copilot", "--allow-all-tools"],
        "cursor" => &["cursor-agent"],
        "kilocode" => &["kilocode", "--auto"],
        other => return vec![other.to_string()],
    };
    cmd.iter().map(|s| s.to_string()).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Actor {
    pub v: u32,
    pub id: String,
    pub title: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub default_scope_key: String,
    pub submit: ActorSubmit,
    pub enabled: bool,
    pub runner: RunnerKind,
    pub runtime: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Default for Actor {
    fn default() -> Self {
        Self {
            v: 1,
            id: String::new(),
            title: String::new(),
            command: Vec::new(),
            env: BTreeMap::new(),
            default_scope_key: String::new(),
            submit: ActorSubmit::Enter,
            enabled: true,
            runner: RunnerKind::Pty,
            runtime: "codex".to_string(),
            created_at: String::new(),
            updated_at: String::new(),
        }
    }
}

const RESERVED_IDS: &[&str] = &[
    "user", "all", "system", "foreman", "peers", "admin", "root", "cccc", "@all", "@peers",
    "@foreman", "@user",
];

fn actor_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // \w is Unicode-aware here, so CJK names are accepted without an
    // explicit script list. Hyphens only after the first character.
    RE.get_or_init(|| Regex::new(r"^\w[\w-]{0,31}$").expect("actor id regex"))
}

/// Validate and normalize an actor id.
pub fn validate_actor_id(actor_id: &str) -> OpResult<String> {
    let aid = actor_id.trim();
    if aid.is_empty() {
        return Err(OpError::new("actor_add_failed", "please enter a name"));
    }
    if aid.chars().count() > 32 {
        return Err(OpError::new(
            "actor_add_failed",
            "name must be 32 characters or less",
        ));
    }
    if aid.contains(char::is_whitespace) {
        return Err(OpError::new("actor_add_failed", "name cannot contain spaces"));
    }
    for (ch, why) in [
        ('.', "name cannot contain dots"),
        ('@', "name cannot contain @"),
        ('/', "name cannot contain slashes"),
        ('\\', "name cannot contain slashes"),
    ] {
        if aid.contains(ch) {
            return Err(OpError::new("actor_add_failed", why));
        }
    }
    if !actor_id_re().is_match(aid) {
        return Err(OpError::new(
            "actor_add_failed",
            "name can only contain letters, numbers, hyphens, and underscores",
        ));
    }
    let lower = aid.to_lowercase();
    if RESERVED_IDS.contains(&lower.as_str()) {
        return Err(OpError::new(
            "actor_add_failed",
            format!("'{aid}' is reserved, please use another name"),
        ));
    }
    Ok(aid.to_string())
}

pub fn list_actors(group: &Group) -> &[Actor] {
    &group.doc.actors
}

pub fn find_actor<'a>(group: &'a Group, actor_id: &str) -> Option<&'a Actor> {
    let wanted = actor_id.trim();
    if wanted.is_empty() {
        return None;
    }
    group.doc.actors.iter().find(|a| a.id == wanted)
}

/// First enabled actor, if any. That actor is the foreman.
pub fn find_foreman(group: &Group) -> Option<&Actor> {
    group.doc.actors.iter().find(|a| a.enabled)
}

/// Positional role: foreman iff this is the first enabled actor.
pub fn effective_role(group: &Group, actor_id: &str) -> ActorRole {
    let wanted = actor_id.trim();
    match find_foreman(group) {
        Some(foreman) if foreman.id == wanted => ActorRole::Foreman,
        _ => ActorRole::Peer,
    }
}

/// Actor serialized for API responses, with the computed role included.
pub fn actor_view(group: &Group, actor: &Actor) -> Value {
    let mut value = serde_json::to_value(actor).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        let role = match effective_role(group, &actor.id) {
            ActorRole::Foreman => "foreman",
            ActorRole::Peer => "peer",
        };
        map.insert("role".to_string(), Value::String(role.to_string()));
    }
    value
}

pub fn actor_views(group: &Group) -> Vec<Value> {
    group
        .doc
        .actors
        .iter()
        .map(|a| actor_view(group, a))
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct NewActor {
    pub id: String,
    pub title: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub default_scope_key: String,
    pub submit: Option<ActorSubmit>,
    pub enabled: bool,
    pub runner: Option<RunnerKind>,
    pub runtime: Option<String>,
}

pub fn add_actor(group: &mut Group, spec: NewActor) -> OpResult<Actor> {
    let aid = validate_actor_id(&spec.id)?;
    if find_actor(group, &aid).is_some() {
        return Err(OpError::new(
            "actor_add_failed",
            format!("name already exists: {aid}"),
        ));
    }

    let runtime = spec
        .runtime
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "codex".to_string());
    if !KNOWN_RUNTIMES.contains(&runtime.as_str()) {
        return Err(OpError::new("actor_add_failed", "invalid runtime"));
    }
    let runner = spec.runner.unwrap_or_default();
    let mut command = spec.command;
    if command.is_empty() && runner == RunnerKind::Pty {
        if runtime == "custom" {
            return Err(OpError::new(
                "actor_add_failed",
                "custom runtime requires a command (PTY runner)",
            ));
        }
        command = runtime_default_command(&runtime);
    }

    let now = utc_now_iso();
    let actor = Actor {
        v: 1,
        id: aid,
        title: spec.title.trim().to_string(),
        command,
        env: spec.env,
        default_scope_key: spec.default_scope_key.trim().to_string(),
        submit: spec.submit.unwrap_or_default(),
        enabled: spec.enabled,
        runner,
        runtime,
        created_at: now.clone(),
        updated_at: now,
    };
    group.doc.actors.push(actor.clone());
    group
        .save()
        .map_err(|e| OpError::new("actor_add_failed", e.to_string()))?;
    Ok(actor)
}

pub fn remove_actor(group: &mut Group, actor_id: &str) -> OpResult<()> {
    let aid = actor_id.trim();
    if aid.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let before = group.doc.actors.len();
    group.doc.actors.retain(|a| a.id != aid);
    if group.doc.actors.len() == before {
        return Err(OpError::actor_not_found(aid));
    }
    group
        .save()
        .map_err(|e| OpError::new("actor_remove_failed", e.to_string()))
}

/// Rewrite the actor order. `actor_ids` must be the exact current id set
/// with no duplicates; the first enabled id becomes the foreman.
pub fn reorder_actors(group: &mut Group, actor_ids: &[String]) -> OpResult<()> {
    let current: BTreeMap<String, Actor> = group
        .doc
        .actors
        .iter()
        .map(|a| (a.id.clone(), a.clone()))
        .collect();

    let mut seen = std::collections::BTreeSet::new();
    for aid in actor_ids {
        if !current.contains_key(aid) {
            return Err(OpError::actor_not_found(aid));
        }
        if !seen.insert(aid.clone()) {
            return Err(OpError::new(
                "actor_reorder_failed",
                "duplicate actor ids in list",
            ));
        }
    }
    if seen.len() != current.len() {
        return Err(OpError::new(
            "actor_reorder_failed",
            "actor_ids must include all actors",
        ));
    }

    group.doc.actors = actor_ids
        .iter()
        .map(|aid| current.get(aid).cloned().expect("validated above"))
        .collect();
    group
        .save()
        .map_err(|e| OpError::new("actor_reorder_failed", e.to_string()))
}

/// Patch for `actor_update`. Absent fields leave the actor untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorPatch {
    pub title: Option<String>,
    pub command: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub default_scope_key: Option<String>,
    pub submit: Option<ActorSubmit>,
    pub enabled: Option<bool>,
    pub runner: Option<RunnerKind>,
    pub runtime: Option<String>,
}

pub fn update_actor(group: &mut Group, actor_id: &str, patch: ActorPatch) -> OpResult<Actor> {
    let idx = group
        .doc
        .actors
        .iter()
        .position(|a| a.id == actor_id.trim())
        .ok_or_else(|| OpError::actor_not_found(actor_id.trim()))?;

    {
        let actor = &mut group.doc.actors[idx];
        if let Some(title) = patch.title {
            actor.title = title.trim().to_string();
        }
        if let Some(command) = patch.command {
            actor.command = command.into_iter().filter(|c| !c.trim().is_empty()).collect();
        }
        if let Some(env) = patch.env {
            actor.env = env;
        }
        if let Some(key) = patch.default_scope_key {
            actor.default_scope_key = key.trim().to_string();
        }
        if let Some(submit) = patch.submit {
            actor.submit = submit;
        }
        if let Some(enabled) = patch.enabled {
            actor.enabled = enabled;
        }
        if let Some(runner) = patch.runner {
            actor.runner = runner;
        }
        if let Some(runtime) = patch.runtime {
            let rt = runtime.trim().to_string();
            if !KNOWN_RUNTIMES.contains(&rt.as_str()) {
                return Err(OpError::new("actor_update_failed", "invalid runtime"));
            }
            actor.runtime = rt;
        }

        if actor.runtime == "custom" && actor.runner == RunnerKind::Pty && actor.command.is_empty()
        {
            return Err(OpError::new(
                "actor_update_failed",
                "custom runtime requires a command (PTY runner)",
            ));
        }
        // Empty command on a non-custom PTY runtime means "use the default".
        if actor.runner == RunnerKind::Pty && actor.runtime != "custom" && actor.command.is_empty()
        {
            actor.command = runtime_default_command(&actor.runtime);
        }
        actor.updated_at = utc_now_iso();
    }

    group
        .save()
        .map_err(|e| OpError::new("actor_update_failed", e.to_string()))?;
    Ok(group.doc.actors[idx].clone())
}

/// Resolve recipient tokens against the group's actor list.
///
/// Accepts actor ids, titles (case-insensitive, must be unambiguous), the
/// selectors `@all` / `@peers` / `@foreman`, `user`, and IM-style `@id`
/// mentions. Deduplicates while preserving order.
pub fn resolve_recipient_tokens(group: &Group, tokens: &[String]) -> OpResult<Vec<String>> {
    let actors = list_actors(group);
    let id_set: std::collections::BTreeSet<&str> = actors.iter().map(|a| a.id.as_str()).collect();
    let mut title_map: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for a in actors {
        let title = a.title.trim();
        if !title.is_empty() {
            title_map
                .entry(title.to_lowercase())
                .or_default()
                .push(a.id.as_str());
        }
    }

    let mut out: Vec<String> = Vec::new();
    let mut seen = std::collections::BTreeSet::new();
    for raw in tokens {
        let mut t = raw.trim();
        if t.is_empty() {
            continue;
        }
        if t.starts_with('@') && !matches!(t, "@all" | "@peers" | "@foreman" | "@user") {
            t = t[1..].trim();
            if t.is_empty() {
                continue;
            }
        }
        let canonical: String = match t {
            "@all" | "@peers" | "@foreman" => t.to_string(),
            "user" | "@user" => "user".to_string(),
            other if id_set.contains(other) => other.to_string(),
            other => {
                let ids = title_map.get(&other.to_lowercase());
                match ids.map(|v| v.as_slice()) {
                    Some([one]) => one.to_string(),
                    Some([_, ..]) => {
                        return Err(OpError::new(
                            "invalid_recipient",
                            format!("ambiguous recipient title: {other}"),
                        ));
                    }
                    _ => {
                        return Err(OpError::new(
                            "invalid_recipient",
                            format!("unknown recipient: {other}"),
                        ));
                    }
                }
            }
        };
        if seen.insert(canonical.clone()) {
            out.push(canonical);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::Group;

    fn test_group() -> (tempfile::TempDir, Group) {
        let home = tempfile::tempdir().unwrap();
        let mut reg = crate::registry::Registry::load(home.path()).unwrap();
        let group = crate::group::create_group(home.path(), &mut reg, "test", "").unwrap();
        (home, group)
    }

    #[test]
    fn id_validation_accepts_unicode_and_rejects_reserved() {
        assert!(validate_actor_id("peer-a").is_ok());
        assert!(validate_actor_id("审查员").is_ok());
        assert!(validate_actor_id("user").is_err());
        assert!(validate_actor_id("USER").is_err());
        assert!(validate_actor_id("@all").is_err());
        assert!(validate_actor_id("has space").is_err());
        assert!(validate_actor_id("a.b").is_err());
        assert!(validate_actor_id("-leading").is_err());
        assert!(validate_actor_id(&"x".repeat(33)).is_err());
    }

    #[test]
    fn first_enabled_actor_is_foreman() {
        let (_home, mut group) = test_group();
        add_actor(&mut group, NewActor { id: "alpha".into(), enabled: true, ..Default::default() })
            .unwrap();
        add_actor(&mut group, NewActor { id: "beta".into(), enabled: true, ..Default::default() })
            .unwrap();
        assert_eq!(effective_role(&group, "alpha"), ActorRole::Foreman);
        assert_eq!(effective_role(&group, "beta"), ActorRole::Peer);

        // Disabling the first actor promotes the next enabled one.
        update_actor(&mut group, "alpha", ActorPatch { enabled: Some(false), ..Default::default() })
            .unwrap();
        assert_eq!(effective_role(&group, "beta"), ActorRole::Foreman);
        assert_eq!(effective_role(&group, "alpha"), ActorRole::Peer);
    }

    #[test]
    fn reorder_changes_the_foreman() {
        let (_home, mut group) = test_group();
        add_actor(&mut group, NewActor { id: "a".into(), enabled: true, ..Default::default() })
            .unwrap();
        add_actor(&mut group, NewActor { id: "b".into(), enabled: true, ..Default::default() })
            .unwrap();
        reorder_actors(&mut group, &["b".to_string(), "a".to_string()]).unwrap();
        assert_eq!(effective_role(&group, "b"), ActorRole::Foreman);

        assert!(reorder_actors(&mut group, &["b".to_string()]).is_err());
        assert!(reorder_actors(&mut group, &["b".to_string(), "b".to_string()]).is_err());
    }

    #[test]
    fn custom_pty_runtime_requires_a_command() {
        let (_home, mut group) = test_group();
        let err = add_actor(
            &mut group,
            NewActor { id: "solo".into(), enabled: true, runtime: Some("custom".into()), ..Default::default() },
        );
        assert!(err.is_err());

        // Non-custom runtimes get the built-in default command list.
        let actor = add_actor(
            &mut group,
            NewActor { id: "worker".into(), enabled: true, runtime: Some("claude".into()), ..Default::default() },
        )
        .unwrap();
        assert_eq!(actor.command[0], "claude");
    }

    #[test]
    fn recipient_resolution_handles_ids_titles_and_selectors() {
        let (_home, mut group) = test_group();
        add_actor(
            &mut group,
            NewActor { id: "peer-a".into(), title: "Reviewer".into(), enabled: true, ..Default::default() },
        )
        .unwrap();

        let to = resolve_recipient_tokens(
            &group,
            &["@all".into(), "peer-a".into(), "reviewer".into(), "user".into()],
        )
        .unwrap();
        // peer-a and "reviewer" collapse to one entry.
        assert_eq!(to, vec!["@all", "peer-a", "user"]);

        assert!(resolve_recipient_tokens(&group, &["nobody".into()]).is_err());
    }

    #[test]
    fn mention_prefix_is_stripped() {
        let (_home, mut group) = test_group();
        add_actor(&mut group, NewActor { id: "peer-a".into(), enabled: true, ..Default::default() })
            .unwrap();
        let to = resolve_recipient_tokens(&group, &["@peer-a".into()]).unwrap();
        assert_eq!(to, vec!["peer-a"]);
    }
}
