//! Group lifecycle ops.

use serde_json::Value;

use cccc_core::active::{load_active, set_active_group_id};
use cccc_core::error::{OpError, OpResult};
use cccc_core::global_events::publish_event;
use cccc_core::group::{
    attach_scope_to_group, create_group, delete_group, detach_scope_from_group,
    ensure_group_for_scope, load_group, set_active_scope, update_group,
};
use cccc_core::ledger::append_event;
use cccc_core::permissions::{GroupAction, require_group_permission};
use cccc_core::registry::Registry;
use cccc_core::scope::detect_scope;

use super::{arg_by, arg_str, require_group, spawn_enabled_actors};
use crate::runner_state::clear_group_pty_state;
use crate::server::Daemon;

fn load_registry(daemon: &Daemon) -> OpResult<Registry> {
    Registry::load(&daemon.home).map_err(|e| OpError::new("invalid_request", e.to_string()))
}

/// Derive a scope from a path and attach it — to an explicit group when
/// `group_id` is given, else to the scope's default group (created on
/// demand, keyed by the git-remote hash).
pub async fn attach(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let path = arg_str(args, "path");
    let path = if path.is_empty() { ".".to_string() } else { path };
    let by = arg_by(args);
    let scope = detect_scope(std::path::Path::new(&path));
    let mut reg = load_registry(daemon)?;

    let requested = arg_str(args, "group_id");
    let group = if requested.is_empty() {
        ensure_group_for_scope(&daemon.home, &mut reg, &scope)
            .map_err(|e| OpError::new("invalid_project_root", e.to_string()))?
    } else {
        let mut group = load_group(&daemon.home, &requested)
            .ok_or_else(|| OpError::group_not_found(&requested))?;
        attach_scope_to_group(&mut reg, &mut group, &scope, true)
            .map_err(|e| OpError::new("group_update_failed", e.to_string()))?;
        group
    };

    append_event(
        &group.ledger_path(),
        "group.attach",
        &group.group_id,
        &scope.scope_key,
        &by,
        serde_json::json!({
            "url": scope.url,
            "label": scope.label,
            "git_remote": scope.git_remote,
        }),
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    let _ = set_active_group_id(&daemon.home, &group.group_id);
    publish_event(
        &daemon.home,
        "group.updated",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "scope_key": scope.scope_key,
        "title": group.doc.title,
    }))
}

pub async fn group_create(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let by = arg_by(args);
    let title = arg_str(args, "title");
    let topic = arg_str(args, "topic");
    let mut reg = load_registry(daemon)?;
    let group = create_group(&daemon.home, &mut reg, &title, &topic)
        .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    let event = append_event(
        &group.ledger_path(),
        "group.create",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"title": group.doc.title, "topic": group.doc.topic}),
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    publish_event(
        &daemon.home,
        "group.created",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "title": group.doc.title,
        "event": event,
    }))
}

pub async fn group_show(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let running = daemon.group_running(&group.group_id);
    Ok(serde_json::json!({
        "group": serde_json::to_value(&group.doc).unwrap_or(Value::Null),
        "running": running,
    }))
}

pub async fn group_update(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let patch = args.get("patch").cloned().unwrap_or(Value::Null);
    let Some(patch_obj) = patch.as_object() else {
        return Err(OpError::new("invalid_patch", "empty patch"));
    };
    if patch_obj.is_empty() {
        return Err(OpError::new("invalid_patch", "empty patch"));
    }
    let unknown: Vec<&String> = patch_obj
        .keys()
        .filter(|k| !matches!(k.as_str(), "title" | "topic"))
        .collect();
    if !unknown.is_empty() {
        return Err(OpError::new("invalid_patch", "invalid patch keys")
            .with_details(serde_json::json!({"unknown_keys": unknown})));
    }

    require_group_permission(&group, &by, GroupAction::Update)?;
    let mut reg = load_registry(daemon)?;
    let title = patch_obj.get("title").and_then(|v| v.as_str());
    let topic = patch_obj.get("topic").and_then(|v| v.as_str());
    update_group(&mut reg, &mut group, title, topic)
        .map_err(|e| OpError::new("group_update_failed", e.to_string()))?;

    let event = append_event(
        &group.ledger_path(),
        "group.update",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"patch": patch}),
    )
    .map_err(|e| OpError::new("group_update_failed", e.to_string()))?;

    publish_event(
        &daemon.home,
        "group.updated",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "group": serde_json::to_value(&group.doc).unwrap_or(Value::Null),
        "event": event,
    }))
}

pub async fn group_detach_scope(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let scope_key = arg_str(args, "scope_key");
    if scope_key.is_empty() {
        return Err(OpError::new("missing_scope_key", "missing scope_key"));
    }
    require_group_permission(&group, &by, GroupAction::DetachScope)?;

    let mut reg = load_registry(daemon)?;
    detach_scope_from_group(&mut reg, &mut group, &scope_key)
        .map_err(|e| OpError::new("group_detach_scope_failed", e.to_string()))?;

    let event = append_event(
        &group.ledger_path(),
        "group.detach_scope",
        &group.group_id,
        &scope_key,
        &by,
        serde_json::json!({"scope_key": scope_key}),
    )
    .map_err(|e| OpError::new("group_detach_scope_failed", e.to_string()))?;
    Ok(serde_json::json!({"group_id": group.group_id, "event": event}))
}

pub async fn group_delete(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let by = arg_by(args);
    require_group_permission(&group, &by, GroupAction::Delete)?;

    daemon.supervisor.stop_group(&group.group_id).await;
    daemon.headless.stop_group(&group.group_id);
    daemon.delivery.forget_group(&group.group_id).await;
    let mut reg = load_registry(daemon)?;
    delete_group(&daemon.home, &mut reg, &group.group_id)
        .map_err(|e| OpError::new("group_delete_failed", e.to_string()))?;

    if load_active(&daemon.home).active_group_id == group.group_id {
        let _ = set_active_group_id(&daemon.home, "");
    }
    publish_event(
        &daemon.home,
        "group.deleted",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({"group_id": group.group_id}))
}

pub async fn group_use(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let path = arg_str(args, "path");
    let path = if path.is_empty() { ".".to_string() } else { path };
    let scope = detect_scope(std::path::Path::new(&path));

    let mut reg = load_registry(daemon)?;
    set_active_scope(&mut reg, &mut group, &scope.scope_key)
        .map_err(|_| OpError::scope_not_attached(&scope.scope_key))?;

    let event = append_event(
        &group.ledger_path(),
        "group.set_active_scope",
        &group.group_id,
        &scope.scope_key,
        &by,
        serde_json::json!({"path": scope.url}),
    )
    .map_err(|e| OpError::new("invalid_request", e.to_string()))?;

    let _ = set_active_group_id(&daemon.home, &group.group_id);
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "active_scope_key": scope.scope_key,
        "event": event,
    }))
}

/// List all groups, newest first, with live `running` state.
pub async fn groups(daemon: &Daemon, _args: &Value) -> OpResult<Value> {
    let reg = load_registry(daemon)?;
    let mut metas: Vec<_> = reg.doc.groups.values().cloned().collect();
    metas.sort_by(|a, b| {
        (b.updated_at.as_str(), b.created_at.as_str())
            .cmp(&(a.updated_at.as_str(), a.created_at.as_str()))
    });

    let out: Vec<Value> = metas
        .into_iter()
        .map(|meta| {
            let running = daemon.group_running(&meta.group_id);
            let mut value = serde_json::to_value(&meta).unwrap_or(Value::Null);
            if let Some(map) = value.as_object_mut() {
                map.insert("running".to_string(), Value::Bool(running));
            }
            value
        })
        .collect();
    Ok(serde_json::json!({"groups": out}))
}

pub async fn group_start(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    if group.doc.active_scope_key.trim().is_empty() {
        return Err(OpError::new(
            "missing_project_root",
            "missing project root for group (no active scope)",
        )
        .with_details(serde_json::json!({
            "hint": "attach a project root first (cccc attach <path> --group <id>)",
        })));
    }
    require_group_permission(&group, &by, GroupAction::Start)?;

    let (started, forced_headless) = spawn_enabled_actors(daemon, &group).await?;
    group.doc.running = true;
    group
        .save()
        .map_err(|e| OpError::new("group_start_failed", e.to_string()))?;

    let event = append_event(
        &group.ledger_path(),
        "group.start",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"started": started, "forced_headless": forced_headless}),
    )
    .map_err(|e| OpError::new("group_start_failed", e.to_string()))?;

    publish_event(
        &daemon.home,
        "group.updated",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "started": started,
        "event": event,
    }))
}

pub async fn group_stop(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    require_group_permission(&group, &by, GroupAction::Stop)?;

    daemon.supervisor.stop_group(&group.group_id).await;
    daemon.headless.stop_group(&group.group_id);
    daemon.delivery.forget_group(&group.group_id).await;
    group.doc.running = false;
    group
        .save()
        .map_err(|e| OpError::new("group_stop_failed", e.to_string()))?;
    clear_group_pty_state(&daemon.home, &group.group_id);

    let event = append_event(
        &group.ledger_path(),
        "group.stop",
        &group.group_id,
        "",
        &by,
        serde_json::json!({}),
    )
    .map_err(|e| OpError::new("group_stop_failed", e.to_string()))?;

    publish_event(
        &daemon.home,
        "group.updated",
        serde_json::json!({"group_id": group.group_id}),
    );
    Ok(serde_json::json!({"group_id": group.group_id, "event": event}))
}

/// Flip the delivery state between `active` and `paused`. Pausing keeps
/// processes alive but suppresses delivery and automation.
pub async fn group_set_state(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let state = arg_str(args, "state");
    if !matches!(state.as_str(), "active" | "paused") {
        return Err(OpError::new(
            "invalid_request",
            "state must be 'active' or 'paused'",
        ));
    }
    require_group_permission(&group, &by, GroupAction::SetState)?;

    group.doc.state = state.clone();
    group
        .save()
        .map_err(|e| OpError::new("group_update_failed", e.to_string()))?;

    let event = append_event(
        &group.ledger_path(),
        "group.set_state",
        &group.group_id,
        "",
        &by,
        serde_json::json!({"state": state}),
    )
    .map_err(|e| OpError::new("group_update_failed", e.to_string()))?;
    Ok(serde_json::json!({"group_id": group.group_id, "state": state, "event": event}))
}
