//! Actor lifecycle ops.

use std::collections::HashMap;

use serde_json::Value;

use cccc_core::actor::{
    Actor, ActorPatch, NewActor, RunnerKind, actor_view, actor_views, add_actor, find_actor,
    list_actors, remove_actor, reorder_actors, update_actor,
};
use cccc_core::error::{OpError, OpResult};
use cccc_core::group::Group;
use cccc_core::ledger::append_event;
use cccc_core::permissions::{ActorAction, require_actor_permission};

use super::{arg_by, arg_str, arg_str_list, require_group};
use crate::pty::pty_supported;
use crate::runner_state::{remove_pty_state_if_pid, write_pty_state};
use crate::server::Daemon;
use crate::system_prompt::inject_system_prompt;

/// Resolve an actor's working directory against the group's scopes.
fn resolve_actor_cwd(group: &Group, actor: &Actor) -> OpResult<std::path::PathBuf> {
    let group_scope = group.doc.active_scope_key.trim();
    if group_scope.is_empty() && actor.default_scope_key.trim().is_empty() {
        return Err(OpError::new(
            "missing_project_root",
            "missing project root for group (no active scope)",
        ));
    }
    let scope_key = if actor.default_scope_key.trim().is_empty() {
        group_scope
    } else {
        actor.default_scope_key.trim()
    };
    let url = group
        .scope_url(scope_key)
        .ok_or_else(|| OpError::scope_not_attached(scope_key))?;
    let cwd = std::path::PathBuf::from(url);
    if !cwd.exists() {
        return Err(OpError::invalid_project_root(url));
    }
    Ok(cwd)
}

/// Spawn one enabled actor: pty session + runner sidecar + SYSTEM prompt.
/// Returns the effective runner used.
async fn spawn_actor(daemon: &Daemon, group: &Group, actor: &Actor) -> OpResult<RunnerKind> {
    let runner = if actor.runner == RunnerKind::Pty && !pty_supported() {
        RunnerKind::Headless
    } else {
        actor.runner
    };
    if runner == RunnerKind::Headless {
        // Headless actors have no process to supervise; register the session
        // so status/ack ops and the file mailbox work.
        daemon.headless.start_actor(&group.group_id, &actor.id);
        return Ok(runner);
    }

    let cwd = resolve_actor_cwd(group, actor)?;
    let env: HashMap<String, String> = actor.env.clone().into_iter().collect();
    let session = daemon
        .supervisor
        .start_actor(&group.group_id, &actor.id, &cwd, &actor.command, &env, 0)
        .map_err(|e| OpError::new("actor_start_failed", e.to_string()))?;
    write_pty_state(&daemon.home, &group.group_id, &actor.id, session.pid());
    inject_system_prompt(&daemon.supervisor, group, &actor.id).await;
    Ok(runner)
}

/// Spawn all enabled actors for `group_start` / startup autostart. Returns
/// (started ids, ids forced to headless).
pub async fn spawn_enabled_actors(
    daemon: &Daemon,
    group: &Group,
) -> OpResult<(Vec<String>, Vec<String>)> {
    // Validate every actor's cwd before spawning anything, so a bad scope
    // fails the op without leaving half the group running.
    for actor in list_actors(group) {
        if actor.enabled && actor.runner == RunnerKind::Pty && pty_supported() {
            resolve_actor_cwd(group, actor)?;
        }
    }

    let mut started = Vec::new();
    let mut forced_headless = Vec::new();
    for actor in list_actors(group) {
        if !actor.enabled {
            continue;
        }
        match spawn_actor(daemon, group, actor).await? {
            RunnerKind::Pty => started.push(actor.id.clone()),
            RunnerKind::Headless => {
                if actor.runner == RunnerKind::Pty {
                    forced_headless.push(actor.id.clone());
                }
            }
        }
    }
    Ok((started, forced_headless))
}

pub async fn actor_list(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    require_actor_permission(&group, &by, ActorAction::List, "")?;
    Ok(serde_json::json!({"actors": actor_views(&group)}))
}

pub async fn actor_add(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    require_actor_permission(&group, &by, ActorAction::Add, "")?;

    let spec = NewActor {
        id: arg_str(args, "actor_id"),
        title: arg_str(args, "title"),
        command: arg_str_list(args, "command"),
        env: args
            .get("env")
            .and_then(|v| v.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default(),
        default_scope_key: arg_str(args, "default_scope_key"),
        submit: args
            .get("submit")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        enabled: args.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true),
        runner: args
            .get("runner")
            .and_then(|v| serde_json::from_value(v.clone()).ok()),
        runtime: args
            .get("runtime")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| {
                // No runtime requested: take the top of the global runtime pool.
                let settings = cccc_core::settings::load_settings(&daemon.home);
                cccc_core::settings::runtime_pool(&settings)
                    .first()
                    .map(|entry| entry.runtime.clone())
            }),
    };
    let actor = add_actor(&mut group, spec)?;
    let view = actor_view(&group, &actor);

    let event = append_event(
        &group.ledger_path(),
        "actor.add",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor": view}),
    )
    .map_err(|e| OpError::new("actor_add_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor": view, "event": event}))
}

pub async fn actor_remove(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let actor_id = arg_str(args, "actor_id");
    require_actor_permission(&group, &by, ActorAction::Remove, &actor_id)?;

    remove_actor(&mut group, &actor_id)?;
    daemon.supervisor.stop_actor(&group.group_id, &actor_id).await;
    daemon.headless.stop_actor(&group.group_id, &actor_id);
    remove_pty_state_if_pid(&daemon.home, &group.group_id, &actor_id, 0);

    let event = append_event(
        &group.ledger_path(),
        "actor.remove",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id}),
    )
    .map_err(|e| OpError::new("actor_remove_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor_id": actor_id, "event": event}))
}

pub async fn actor_update(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let actor_id = arg_str(args, "actor_id");
    let patch_value = args.get("patch").cloned().unwrap_or(Value::Null);
    if !patch_value.is_object() || patch_value.as_object().is_some_and(|o| o.is_empty()) {
        return Err(OpError::new("invalid_patch", "empty patch"));
    }
    require_actor_permission(&group, &by, ActorAction::Update, &actor_id)?;

    let enabled_patched = patch_value.get("enabled").is_some();
    let patch: ActorPatch = serde_json::from_value(patch_value.clone())
        .map_err(|e| OpError::new("invalid_patch", e.to_string()))?;
    let actor = update_actor(&mut group, &actor_id, patch)?;

    // Enabling/disabling a member of a running group takes effect immediately.
    if enabled_patched && group.doc.running {
        if actor.enabled {
            spawn_actor(daemon, &group, &actor).await?;
        } else {
            daemon.supervisor.stop_actor(&group.group_id, &actor_id).await;
            daemon.headless.stop_actor(&group.group_id, &actor_id);
            remove_pty_state_if_pid(&daemon.home, &group.group_id, &actor_id, 0);
        }
    }

    let view = actor_view(&group, &actor);
    let event = append_event(
        &group.ledger_path(),
        "actor.update",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id, "patch": patch_value}),
    )
    .map_err(|e| OpError::new("actor_update_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor": view, "event": event}))
}

pub async fn actor_start(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let actor_id = arg_str(args, "actor_id");
    require_actor_permission(&group, &by, ActorAction::Start, &actor_id)?;

    let actor = update_actor(
        &mut group,
        &actor_id,
        ActorPatch {
            enabled: Some(true),
            ..Default::default()
        },
    )
    .map_err(|e| OpError::new("actor_start_failed", e.message))?;

    let mut runner_effective = None;
    if group.doc.running {
        let effective = spawn_actor(daemon, &group, &actor).await?;
        if effective != actor.runner {
            runner_effective = Some("headless".to_string());
        }
    }

    let event = append_event(
        &group.ledger_path(),
        "actor.start",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id, "runner_effective": runner_effective}),
    )
    .map_err(|e| OpError::new("actor_start_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor": actor_view(&group, &actor), "event": event}))
}

pub async fn actor_stop(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let actor_id = arg_str(args, "actor_id");
    require_actor_permission(&group, &by, ActorAction::Stop, &actor_id)?;

    let actor = update_actor(
        &mut group,
        &actor_id,
        ActorPatch {
            enabled: Some(false),
            ..Default::default()
        },
    )
    .map_err(|e| OpError::new("actor_stop_failed", e.message))?;
    daemon.supervisor.stop_actor(&group.group_id, &actor_id).await;
    daemon.headless.stop_actor(&group.group_id, &actor_id);
    remove_pty_state_if_pid(&daemon.home, &group.group_id, &actor_id, 0);

    let event = append_event(
        &group.ledger_path(),
        "actor.stop",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id}),
    )
    .map_err(|e| OpError::new("actor_stop_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor": actor_view(&group, &actor), "event": event}))
}

pub async fn actor_restart(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let actor_id = arg_str(args, "actor_id");
    require_actor_permission(&group, &by, ActorAction::Restart, &actor_id)?;

    let actor = update_actor(
        &mut group,
        &actor_id,
        ActorPatch {
            enabled: Some(true),
            ..Default::default()
        },
    )
    .map_err(|e| OpError::new("actor_restart_failed", e.message))?;
    daemon.supervisor.stop_actor(&group.group_id, &actor_id).await;
    daemon.headless.stop_actor(&group.group_id, &actor_id);
    remove_pty_state_if_pid(&daemon.home, &group.group_id, &actor_id, 0);

    if group.doc.running {
        spawn_actor(daemon, &group, &actor).await?;
    }

    let event = append_event(
        &group.ledger_path(),
        "actor.restart",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_id": actor_id}),
    )
    .map_err(|e| OpError::new("actor_restart_failed", e.to_string()))?;
    Ok(serde_json::json!({"actor": actor_view(&group, &actor), "event": event}))
}

/// Reorder actors; the first enabled id becomes the foreman.
pub async fn actor_reorder(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    // Reordering changes the foreman, so it is group-level surgery.
    cccc_core::permissions::require_group_permission(
        &group,
        &by,
        cccc_core::permissions::GroupAction::Update,
    )?;
    let actor_ids = arg_str_list(args, "actor_ids");
    reorder_actors(&mut group, &actor_ids)?;

    let event = append_event(
        &group.ledger_path(),
        "actor.reorder",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"actor_ids": actor_ids}),
    )
    .map_err(|e| OpError::new("actor_reorder_failed", e.to_string()))?;
    Ok(serde_json::json!({"actors": actor_views(&group), "event": event}))
}

/// Back-compat shim: roles are positional now, so this only reports the
/// actor's current effective role without changing anything.
pub async fn actor_set_role(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    let actor = find_actor(&group, &actor_id).ok_or_else(|| OpError::actor_not_found(&actor_id))?;
    Ok(serde_json::json!({
        "actor": actor_view(&group, actor),
        "note": "roles are positional; use actor_reorder to change the foreman",
    }))
}

pub async fn term_resize(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let actor_id = arg_str(args, "actor_id");
    if actor_id.is_empty() {
        return Err(OpError::missing_actor_id());
    }
    let cols = args.get("cols").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    let rows = args.get("rows").and_then(|v| v.as_u64()).unwrap_or(0) as u16;
    daemon.supervisor.resize(&group.group_id, &actor_id, cols, rows);
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "actor_id": actor_id,
        "cols": cols,
        "rows": rows,
    }))
}
