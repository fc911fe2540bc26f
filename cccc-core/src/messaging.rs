//! Send-policy helpers: who gets a message when `to` is empty, and who the
//! default reply audience is.

use crate::actor::list_actors;
use crate::event::Event;
use crate::group::Group;
use crate::inbox::is_message_for_actor;

/// True when the to-list targets any agent (as opposed to user-only).
pub fn targets_any_agent(to: &[String]) -> bool {
    if to.is_empty() {
        return true;
    }
    for token in to {
        let t = token.trim();
        if t.is_empty() || t == "user" || t == "@user" {
            continue;
        }
        return true;
    }
    false
}

/// Enabled actor ids that would receive a `chat.message` with this to-list.
pub fn enabled_recipient_actor_ids(group: &Group, to: &[String]) -> Vec<String> {
    let probe = Event::new(
        "chat.message",
        &group.group_id,
        "",
        "",
        serde_json::json!({"to": to}),
    );
    list_actors(group)
        .iter()
        .filter(|a| a.enabled)
        .filter(|a| is_message_for_actor(group, &a.id, &probe))
        .map(|a| a.id.clone())
        .collect()
}

/// Default recipients for a reply when `to` is omitted.
///
/// Replying to someone else defaults to that sender; replying to your own
/// message preserves its audience; otherwise the group send policy decides.
pub fn default_reply_recipients(group: &Group, by: &str, original: &Event) -> Vec<String> {
    let who = if by.trim().is_empty() { "user" } else { by.trim() };
    let original_by = original.by.trim();

    if !original_by.is_empty() && original_by != who {
        return if original_by == "user" {
            vec!["user".to_string()]
        } else {
            vec![original_by.to_string()]
        };
    }

    let original_to: Vec<String> = original.data["to"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    if !original_to.is_empty() {
        return original_to;
    }

    if group.doc.messaging.default_send_to.trim() == "broadcast" {
        Vec::new()
    } else {
        vec!["@foreman".to_string()]
    }
}
