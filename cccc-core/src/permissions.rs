//! Authorization matrix for daemon ops.
//!
//! `user` (any `by` that is not an actor id of the group — canonically the
//! literal "user") has all rights. The foreman may manage actors and the
//! group; peers may only act on themselves. Unknown actor ids are rejected.
//!
//! | Action        | user | foreman  | peer     |
//! |---------------|------|----------|----------|
//! | actor.list    | yes  | yes      | yes      |
//! | actor.add     | yes  | yes      | no       |
//! | actor.start   | yes  | yes (any)| no       |
//! | actor.stop    | yes  | yes (any)| self only|
//! | actor.restart | yes  | yes (any)| self only|
//! | actor.remove  | yes  | self only| self only|
//! | actor.update  | yes  | no       | no       |
//! | group.*       | yes  | yes      | no       |

use crate::actor::{ActorRole, effective_role, find_actor};
use crate::error::{OpError, OpResult};
use crate::group::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorAction {
    List,
    Add,
    Remove,
    Update,
    Start,
    Stop,
    Restart,
}

impl ActorAction {
    fn name(&self) -> &'static str {
        match self {
            Self::List => "actor.list",
            Self::Add => "actor.add",
            Self::Remove => "actor.remove",
            Self::Update => "actor.update",
            Self::Start => "actor.start",
            Self::Stop => "actor.stop",
            Self::Restart => "actor.restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupAction {
    Start,
    Stop,
    Update,
    DetachScope,
    Delete,
    SetState,
}

impl GroupAction {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "group.start",
            Self::Stop => "group.stop",
            Self::Update => "group.update",
            Self::DetachScope => "group.detach_scope",
            Self::Delete => "group.delete",
            Self::SetState => "group.set_state",
        }
    }
}

fn caller_role(group: &Group, by: &str) -> OpResult<Option<ActorRole>> {
    let who = by.trim();
    if who.is_empty() || who == "user" {
        return Ok(None);
    }
    if find_actor(group, who).is_none() {
        return Err(OpError::permission_denied(format!("unknown actor: {who}")));
    }
    Ok(Some(effective_role(group, who)))
}

pub fn require_actor_permission(
    group: &Group,
    by: &str,
    action: ActorAction,
    target_actor_id: &str,
) -> OpResult<()> {
    let Some(role) = caller_role(group, by)? else {
        return Ok(());
    };
    let who = by.trim();
    let target = target_actor_id.trim();

    match role {
        ActorRole::Foreman => match action {
            ActorAction::List | ActorAction::Add | ActorAction::Start | ActorAction::Stop
            | ActorAction::Restart => Ok(()),
            ActorAction::Remove => {
                if !target.is_empty() && target == who {
                    Ok(())
                } else {
                    Err(OpError::permission_denied(format!(
                        "foreman can only remove self, not {target}"
                    )))
                }
            }
            ActorAction::Update => Err(OpError::permission_denied(
                "actor.update is only available via CLI/Web UI",
            )),
        },
        ActorRole::Peer => match action {
            ActorAction::List => Ok(()),
            ActorAction::Stop | ActorAction::Restart | ActorAction::Remove => {
                if !target.is_empty() && target == who {
                    Ok(())
                } else {
                    Err(OpError::permission_denied(format!(
                        "peer can only {} self, not {target}",
                        action.name()
                    )))
                }
            }
            ActorAction::Add => Err(OpError::permission_denied("only foreman can add actors")),
            ActorAction::Start => Err(OpError::permission_denied("only foreman can start actors")),
            ActorAction::Update => Err(OpError::permission_denied(
                "actor.update is only available via CLI/Web UI",
            )),
        },
    }
}

pub fn require_inbox_permission(group: &Group, by: &str, target_actor_id: &str) -> OpResult<()> {
    let Some(role) = caller_role(group, by)? else {
        return Ok(());
    };
    match role {
        ActorRole::Foreman => Ok(()),
        ActorRole::Peer => {
            let who = by.trim();
            let target = target_actor_id.trim();
            if !target.is_empty() && target == who {
                Ok(())
            } else {
                Err(OpError::permission_denied(format!(
                    "{who} cannot access inbox of {target}"
                )))
            }
        }
    }
}

pub fn require_group_permission(group: &Group, by: &str, action: GroupAction) -> OpResult<()> {
    let Some(role) = caller_role(group, by)? else {
        return Ok(());
    };
    match role {
        ActorRole::Foreman => Ok(()),
        ActorRole::Peer => Err(OpError::permission_denied(format!(
            "{} cannot {}",
            by.trim(),
            action.name()
        ))),
    }
}
