//! Per-actor inboxes over the ledger.
//!
//! The ledger is the queue: an actor's inbox is the set of `chat.message`
//! events targeting it with a timestamp past its read cursor. Cursors only
//! move forward.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::actor::{ActorRole, effective_role};
use crate::event::Event;
use crate::fsutil::{atomic_write_json, read_json_or_default};
use crate::group::Group;
use crate::ledger::iter_events;
use crate::timeutil::{parse_utc_iso, utc_now_iso};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadCursor {
    pub event_id: String,
    pub ts: String,
    pub updated_at: String,
}

fn cursors_path(group: &Group) -> PathBuf {
    group.state_dir().join("read_cursors.json")
}

pub fn load_cursors(group: &Group) -> BTreeMap<String, ReadCursor> {
    read_json_or_default(&cursors_path(group))
}

pub fn get_cursor(group: &Group, actor_id: &str) -> ReadCursor {
    load_cursors(group).remove(actor_id).unwrap_or_default()
}

/// Advance an actor's cursor. Never moves backward in `ts`.
pub fn set_cursor(
    group: &Group,
    actor_id: &str,
    event_id: &str,
    ts: &str,
) -> anyhow::Result<ReadCursor> {
    let mut cursors = load_cursors(group);
    if let Some(current) = cursors.get(actor_id) {
        if let (Some(cur), Some(new)) = (parse_utc_iso(&current.ts), parse_utc_iso(ts)) {
            if new < cur {
                return Ok(current.clone());
            }
        }
    }
    let cursor = ReadCursor {
        event_id: event_id.to_string(),
        ts: ts.to_string(),
        updated_at: utc_now_iso(),
    };
    cursors.insert(actor_id.to_string(), cursor.clone());
    atomic_write_json(&cursors_path(group), &cursors)?;
    Ok(cursor)
}

fn message_targets(event: &Event) -> Vec<String> {
    event.data["to"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Targeting rule for `chat.message` events.
///
/// Empty `to` is a broadcast. `@all` matches everyone, an actor id matches
/// itself, `@peers` / `@foreman` match by positional role.
pub fn is_message_for_actor(group: &Group, actor_id: &str, event: &Event) -> bool {
    let targets = message_targets(event);
    if targets.is_empty() {
        return true;
    }
    if targets.iter().any(|t| t == "@all") {
        return true;
    }
    if targets.iter().any(|t| t == actor_id) {
        return true;
    }
    match effective_role(group, actor_id) {
        ActorRole::Peer => targets.iter().any(|t| t == "@peers"),
        ActorRole::Foreman => targets.iter().any(|t| t == "@foreman"),
    }
}

/// Unread `chat.message` events for an actor, oldest first, up to `limit`
/// (0 = unlimited).
pub fn unread_messages(group: &Group, actor_id: &str, limit: usize) -> Vec<Event> {
    let cursor = get_cursor(group, actor_id);
    let cursor_dt = parse_utc_iso(&cursor.ts);

    let mut out = Vec::new();
    for ev in iter_events(&group.ledger_path()) {
        if ev.kind != "chat.message" {
            continue;
        }
        if ev.by == actor_id {
            continue;
        }
        if !is_message_for_actor(group, actor_id, &ev) {
            continue;
        }
        if let Some(cursor_dt) = cursor_dt {
            if let Some(ev_dt) = parse_utc_iso(&ev.ts) {
                if ev_dt <= cursor_dt {
                    continue;
                }
            }
        }
        out.push(ev);
        if limit > 0 && out.len() >= limit {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{NewActor, add_actor};
    use crate::ledger::append_event;
    use crate::registry::Registry;

    fn group_with_actors() -> (tempfile::TempDir, Group) {
        let home = tempfile::tempdir().unwrap();
        let mut reg = Registry::load(home.path()).unwrap();
        let mut group = crate::group::create_group(home.path(), &mut reg, "g", "").unwrap();
        add_actor(&mut group, NewActor { id: "foreman-1".into(), enabled: true, ..Default::default() })
            .unwrap();
        add_actor(&mut group, NewActor { id: "peer-a".into(), enabled: true, ..Default::default() })
            .unwrap();
        (home, group)
    }

    fn send(group: &Group, by: &str, text: &str, to: &[&str]) -> Event {
        append_event(
            &group.ledger_path(),
            "chat.message",
            &group.group_id,
            "",
            by,
            serde_json::json!({"text": text, "to": to}),
        )
        .unwrap()
    }

    #[test]
    fn broadcast_and_selectors_target_correctly() {
        let (_home, group) = group_with_actors();
        let broadcast = send(&group, "user", "hi", &[]);
        let all = send(&group, "user", "hi", &["@all"]);
        let peers = send(&group, "user", "hi", &["@peers"]);
        let foreman = send(&group, "user", "hi", &["@foreman"]);
        let direct = send(&group, "user", "hi", &["peer-a"]);

        assert!(is_message_for_actor(&group, "peer-a", &broadcast));
        assert!(is_message_for_actor(&group, "peer-a", &all));
        assert!(is_message_for_actor(&group, "peer-a", &peers));
        assert!(!is_message_for_actor(&group, "peer-a", &foreman));
        assert!(is_message_for_actor(&group, "peer-a", &direct));

        assert!(is_message_for_actor(&group, "foreman-1", &foreman));
        assert!(!is_message_for_actor(&group, "foreman-1", &peers));
        assert!(!is_message_for_actor(&group, "foreman-1", &direct));
    }

    #[test]
    fn own_messages_are_not_unread() {
        let (_home, group) = group_with_actors();
        send(&group, "peer-a", "mine", &["@all"]);
        send(&group, "user", "for you", &["@all"]);
        let unread = unread_messages(&group, "peer-a", 50);
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].by, "user");
    }

    #[test]
    fn mark_read_advances_cursor_and_filters() {
        let (_home, group) = group_with_actors();
        let first = send(&group, "user", "one", &[]);
        let second = send(&group, "user", "two", &[]);

        assert_eq!(unread_messages(&group, "peer-a", 50).len(), 2);
        set_cursor(&group, "peer-a", &second.id, &second.ts).unwrap();
        assert!(unread_messages(&group, "peer-a", 50).is_empty());

        // Cursor may not move backward.
        set_cursor(&group, "peer-a", &first.id, &first.ts).unwrap();
        let cursor = get_cursor(&group, "peer-a");
        assert_eq!(cursor.event_id, second.id);
    }

    #[test]
    fn limit_bounds_the_result() {
        let (_home, group) = group_with_actors();
        for i in 0..10 {
            send(&group, "user", &format!("m{i}"), &[]);
        }
        assert_eq!(unread_messages(&group, "peer-a", 3).len(), 3);
        assert_eq!(unread_messages(&group, "peer-a", 0).len(), 10);
    }

    #[test]
    fn non_chat_kinds_are_skipped() {
        let (_home, group) = group_with_actors();
        append_event(
            &group.ledger_path(),
            "group.stop",
            &group.group_id,
            "",
            "user",
            serde_json::json!({}),
        )
        .unwrap();
        assert!(unread_messages(&group, "peer-a", 50).is_empty());
    }
}
