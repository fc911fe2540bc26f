//! SYSTEM prompt rendered into an actor's CLI right after spawn (and on
//! periodic refresh).

use cccc_core::actor::{ActorRole, effective_role, list_actors};
use cccc_core::group::Group;

use crate::delivery::pty_submit_text;
use crate::pty::PtySupervisor;

pub fn render_system_prompt(group: &Group, actor_id: &str) -> String {
    let role = match effective_role(group, actor_id) {
        ActorRole::Foreman => "foreman",
        ActorRole::Peer => "peer",
    };
    let mut roster = String::new();
    for actor in list_actors(group) {
        if !actor.enabled {
            continue;
        }
        let r = match effective_role(group, &actor.id) {
            ActorRole::Foreman => "foreman",
            ActorRole::Peer => "peer",
        };
        roster.push_str(&format!("  - {} ({r})", actor.id));
        if !actor.title.is_empty() {
            roster.push_str(&format!(" — {}", actor.title));
        }
        roster.push('\n');
    }

    let title = &group.doc.title;
    let topic = if group.doc.topic.is_empty() {
        String::new()
    } else {
        format!("Topic: {}\n", group.doc.topic)
    };
    format!(
        "[cccc] SYSTEM\n\
         You are actor '{actor_id}' (role: {role}) in working group '{title}'.\n\
         {topic}\
         Members:\n{roster}\
         Messaging:\n\
         - Check your inbox: cccc inbox --actor-id {actor_id} --by {actor_id} --mark-read\n\
         - Send to peers: cccc send {gid} \"<text>\" --by {actor_id} --to <actor|@all|@peers|@foreman|user>\n\
         - Address the human with --to user.\n\
         Keep replies concise; include a Progress: line while working and a Next: line with your next step.",
        gid = group.group_id,
    )
}

/// Inject the SYSTEM prompt into a running actor's PTY (file fallback on
/// terminals without bracketed paste).
pub async fn inject_system_prompt(supervisor: &PtySupervisor, group: &Group, actor_id: &str) {
    let prompt = render_system_prompt(group, actor_id);
    pty_submit_text(supervisor, group, actor_id, &prompt, true).await;
}
