//! Group template export/import ops.

use serde_json::Value;

use cccc_core::error::{OpError, OpResult};
use cccc_core::ledger::append_event;
use cccc_core::permissions::{GroupAction, require_group_permission};
use cccc_core::template::{
    apply_group_template, build_group_template_from_group, dump_group_template,
    parse_group_template, preview_group_template,
};

use super::{arg_bool, arg_by, require_group};
use crate::server::Daemon;

pub async fn group_export_template(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let group = require_group(daemon, args)?;
    let template = build_group_template_from_group(&group, cccc_core::VERSION);
    let yaml = dump_group_template(&template)
        .map_err(|e| OpError::new("invalid_template", e.to_string()))?;
    Ok(serde_json::json!({
        "group_id": group.group_id,
        "template": yaml,
    }))
}

/// Validate a template, optionally preview it, and apply it to the group.
/// With `dry_run` the diff is returned without touching anything.
pub async fn group_apply_template(daemon: &Daemon, args: &Value) -> OpResult<Value> {
    let mut group = require_group(daemon, args)?;
    let by = arg_by(args);
    let text = args
        .get("template")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    let template = parse_group_template(text)
        .map_err(|e| OpError::new("invalid_template", e.to_string()))?;

    require_group_permission(&group, &by, GroupAction::Update)?;
    let diff = preview_group_template(&group, &template);
    if arg_bool(args, "dry_run") {
        return Ok(serde_json::json!({
            "group_id": group.group_id,
            "applied": false,
            "diff": diff,
        }));
    }

    // Stop actors the template removes before they vanish from the roster.
    for actor_id in &diff.actors_remove {
        daemon.supervisor.stop_actor(&group.group_id, actor_id).await;
        daemon.headless.stop_actor(&group.group_id, actor_id);
        crate::runner_state::remove_pty_state_if_pid(&daemon.home, &group.group_id, actor_id, 0);
    }

    apply_group_template(&mut group, &template)
        .map_err(|e| OpError::new("invalid_template", e.to_string()))?;

    let diff_value = serde_json::to_value(&diff).unwrap_or(Value::Null);
    let event = append_event(
        &group.ledger_path(),
        "group.apply_template",
        &group.group_id,
        "",
        &by,
        diff_value.clone(),
    )
    .map_err(|e| OpError::new("invalid_template", e.to_string()))?;

    Ok(serde_json::json!({
        "group_id": group.group_id,
        "applied": true,
        "diff": diff_value,
        "event": event,
    }))
}
