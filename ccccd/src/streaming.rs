//! Event streaming over IPC (`events_stream` op).
//!
//! After the JSON ack, the connection becomes a one-way NDJSON event feed:
//! the server follows the group ledger from its current end and forwards
//! matching events until the client disconnects. Only conversation-grade
//! kinds are streamable; actor subscribers additionally see only messages
//! targeting them (plus their own sends).

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

use cccc_core::event::Event;
use cccc_core::group::Group;
use cccc_core::inbox::is_message_for_actor;
use cccc_core::ledger::LedgerFollower;

pub const STREAMABLE_KINDS: &[&str] = &[
    "chat.message",
    "chat.ack",
    "system.notify",
    "system.notify_ack",
];

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Normalize a requested kind filter: unknown kinds are dropped, an empty
/// result means "all streamable kinds".
pub fn normalize_kind_filter(requested: &[String]) -> Option<BTreeSet<String>> {
    let allowed: BTreeSet<String> = requested
        .iter()
        .map(|k| k.trim().to_string())
        .filter(|k| STREAMABLE_KINDS.contains(&k.as_str()))
        .collect();
    if allowed.is_empty() { None } else { Some(allowed) }
}

/// Whether `by` gets an actor-scoped view (true) or the full feed (false).
pub fn is_actor_view(group: &Group, by: &str) -> bool {
    let who = by.trim();
    !who.is_empty() && who != "user" && cccc_core::actor::find_actor(group, who).is_some()
}

pub fn event_visible(
    group: &Group,
    by: &str,
    actor_view: bool,
    kinds: &Option<BTreeSet<String>>,
    event: &Event,
) -> bool {
    if !STREAMABLE_KINDS.contains(&event.kind.as_str()) {
        return false;
    }
    if let Some(kinds) = kinds {
        if !kinds.contains(&event.kind) {
            return false;
        }
    }
    if actor_view && event.kind == "chat.message" {
        return event.by == by || is_message_for_actor(group, by, event);
    }
    true
}

/// Follow the ledger from its current end, writing matching events as NDJSON
/// until the client closes its side (EOF) or a write fails.
pub async fn stream_events(group: Group, by: String, kinds: Vec<String>, stream: UnixStream) {
    let kinds = normalize_kind_filter(&kinds);
    let actor_view = is_actor_view(&group, &by);
    let mut follower = LedgerFollower::from_end(&group.ledger_path());

    debug!(group_id = %group.group_id, by = %by, actor_view, "event stream opened");
    let (mut read_half, mut write_half) = stream.into_split();
    let mut eof_buf = [0u8; 64];

    loop {
        // The client never sends payload on this channel; readable EOF (or
        // any bytes, which we discard) doubles as the disconnect signal.
        tokio::select! {
            read = read_half.read(&mut eof_buf) => {
                match read {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        for event in follower.poll_events() {
            if !event_visible(&group, &by, actor_view, &kinds, &event) {
                continue;
            }
            let Ok(mut out) = serde_json::to_string(&event) else {
                continue;
            };
            out.push('\n');
            if write_half.write_all(out.as_bytes()).await.is_err() {
                debug!(group_id = %group.group_id, "event stream client gone");
                return;
            }
        }
    }
    debug!(group_id = %group.group_id, "event stream closed");
}
