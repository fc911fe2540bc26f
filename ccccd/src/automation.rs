//! Automation ticker: nudges, self-check cadence, keep-alives.
//!
//! Runs at ~1 Hz over every running, non-paused group. Persistent per-actor
//! counters live in `state/automation.json`; keep-alive scheduling is
//! in-memory only (a missed keep-alive is harmless by design of the
//! suppression rules).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use cccc_core::fsutil::{atomic_write_json, read_json_or_default};
use cccc_core::group::Group;
use cccc_core::inbox::unread_messages;
use cccc_core::timeutil::{parse_utc_iso, utc_now_iso};

use crate::delivery::{DeliveryManager, pty_submit_text};
use crate::pty::PtySupervisor;
use crate::system_prompt::inject_system_prompt;

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*(?:[-*]\s*)?Progress\s*(?:\(|:)").expect("progress regex"))
}

fn next_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?mi)^\s*(?:[-*]\s*)?Next\s*(?:\(|:)\s*(.+)$").expect("next regex"))
}

/// True when the body carries a `Progress:` event line.
pub fn has_progress_line(text: &str) -> bool {
    progress_re().is_match(text)
}

/// Last `Next:` hint in the body, if any.
pub fn extract_next_hint(text: &str) -> Option<String> {
    next_re()
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorAutomationState {
    pub handoff_count: u64,
    pub self_check_count: u64,
    pub last_nudge_event_id: String,
    pub last_nudge_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomationDoc {
    pub v: u32,
    pub updated_at: String,
    pub actors: HashMap<String, ActorAutomationState>,
}

fn state_path(group: &Group) -> PathBuf {
    group.state_dir().join("automation.json")
}

fn load_state(group: &Group) -> AutomationDoc {
    let mut doc: AutomationDoc = read_json_or_default(&state_path(group));
    doc.v = 1;
    doc
}

fn save_state(group: &Group, mut doc: AutomationDoc) {
    doc.updated_at = utc_now_iso();
    let _ = atomic_write_json(&state_path(group), &doc);
}

#[derive(Debug, Clone)]
struct PendingKeepalive {
    due: Instant,
    next_hint: String,
}

pub struct AutomationManager {
    /// (group_id, actor_id) → keep-alive waiting to fire.
    pending_keepalive: Mutex<HashMap<(String, String), PendingKeepalive>>,
}

impl Default for AutomationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AutomationManager {
    pub fn new() -> Self {
        Self {
            pending_keepalive: Mutex::new(HashMap::new()),
        }
    }

    /// One automation pass over every running, non-paused group.
    pub async fn tick(
        &self,
        home: &Path,
        supervisor: &PtySupervisor,
        delivery: &DeliveryManager,
    ) {
        let Ok(entries) = std::fs::read_dir(cccc_core::paths::groups_dir(home)) else {
            return;
        };
        for entry in entries.flatten() {
            let gid = entry.file_name().to_string_lossy().to_string();
            let Some(group) = cccc_core::group::load_group(home, &gid) else {
                continue;
            };
            if !group.doc.running || group.doc.is_paused() {
                continue;
            }
            self.tick_group(&group, supervisor, delivery).await;
        }
    }

    async fn tick_group(
        &self,
        group: &Group,
        supervisor: &PtySupervisor,
        delivery: &DeliveryManager,
    ) {
        self.nudge_pass(group, supervisor).await;
        self.keepalive_pass(group, supervisor, delivery).await;
        delivery.resend_tick(supervisor, group).await;
    }

    /// Nudge actors whose oldest unread message has been waiting too long.
    /// Each unread head event produces at most one nudge per actor.
    async fn nudge_pass(&self, group: &Group, supervisor: &PtySupervisor) {
        let nudge_after = group.doc.delivery.nudge_after_seconds;
        if nudge_after == 0 {
            return;
        }

        let mut state = load_state(group);
        let mut to_nudge: Vec<(String, String)> = Vec::new();
        let now = chrono::Utc::now();

        for actor in cccc_core::actor::list_actors(group) {
            if !actor.enabled || !supervisor.actor_running(&group.group_id, &actor.id) {
                continue;
            }
            let Some(oldest) = unread_messages(group, &actor.id, 1).into_iter().next() else {
                continue;
            };
            let Some(event_dt) = parse_utc_iso(&oldest.ts) else {
                continue;
            };
            let age = (now - event_dt).num_seconds();
            if age < nudge_after as i64 {
                continue;
            }
            let actor_state = state.actors.entry(actor.id.clone()).or_default();
            if actor_state.last_nudge_event_id == oldest.id {
                continue;
            }
            actor_state.last_nudge_event_id = oldest.id.clone();
            actor_state.last_nudge_at = utc_now_iso();
            to_nudge.push((actor.id.clone(), oldest.ts.clone()));
        }

        if to_nudge.is_empty() {
            return;
        }
        save_state(group, state);

        for (actor_id, oldest_ts) in to_nudge {
            info!(group_id = %group.group_id, actor_id = %actor_id, "nudging unread inbox");
            let msg = format!(
                "[cccc] NUDGE: unread message waiting (oldest {oldest_ts}). \
                 Run: cccc inbox --actor-id {actor_id} --by {actor_id} --mark-read"
            );
            pty_submit_text(supervisor, group, &actor_id, &msg, false).await;
            // Mirror the nudge into the ledger so bridges and UIs can show it.
            let _ = cccc_core::ledger::append_event(
                &group.ledger_path(),
                "system.notify",
                &group.group_id,
                "",
                "system",
                serde_json::json!({
                    "kind": "nudge",
                    "message": msg,
                    "target_actor_id": actor_id,
                }),
            );
        }
    }

    /// Count a successful delivery attributed to `by` and emit self-check /
    /// system-refresh prompts on the configured cadence.
    pub async fn on_delivered_message(
        &self,
        group: &Group,
        supervisor: &PtySupervisor,
        actor_id: &str,
        by: &str,
    ) {
        let who = by.trim();
        if who.is_empty() || who == "system" {
            return;
        }
        let every = group.doc.delivery.self_check_every_handoffs;
        if every == 0 {
            return;
        }

        let mut state = load_state(group);
        let actor_state = state.actors.entry(actor_id.to_string()).or_default();
        actor_state.handoff_count += 1;
        let mut send_self_check = false;
        let mut send_refresh = false;
        if actor_state.handoff_count % every == 0 {
            send_self_check = true;
            actor_state.self_check_count += 1;
            let refresh_every = group.doc.delivery.system_refresh_every_self_checks;
            if refresh_every > 0 && actor_state.self_check_count % refresh_every == 0 {
                send_refresh = true;
            }
        }
        save_state(group, state);

        if send_self_check {
            debug!(actor_id, "sending self-check prompt");
            let text = format!(
                "[cccc] SELF-CHECK: reply in 3 bullets — (1) what changed, (2) next step, \
                 (3) blocker/decision. Clear inbox if needed: \
                 cccc inbox --actor-id {actor_id} --by {actor_id} --mark-read"
            );
            pty_submit_text(supervisor, group, actor_id, &text, false).await;
        }
        if send_refresh {
            inject_system_prompt(supervisor, group, actor_id).await;
        }
    }

    /// Schedule a delayed keep-alive back to the sender of a peer-to-peer
    /// message that carries a Progress line.
    pub async fn maybe_schedule_keepalive(&self, group: &Group, sender: &str, body: &str) {
        let delay = group.doc.delivery.keepalive_delay_seconds.max(5);
        if sender.trim().is_empty() || sender == "user" {
            return;
        }
        if !has_progress_line(body) {
            return;
        }
        let next_hint = extract_next_hint(body).unwrap_or_default();
        let mut pending = self.pending_keepalive.lock().await;
        pending.insert(
            (group.group_id.clone(), sender.to_string()),
            PendingKeepalive {
                due: Instant::now() + std::time::Duration::from_secs(delay),
                next_hint,
            },
        );
        debug!(sender, delay, "keepalive scheduled");
    }

    /// Fire due keep-alives unless suppressed: a sender with unread inbox
    /// items or in-flight/queued handoffs does not need a reminder.
    async fn keepalive_pass(
        &self,
        group: &Group,
        supervisor: &PtySupervisor,
        delivery: &DeliveryManager,
    ) {
        let due: Vec<(String, PendingKeepalive)> = {
            let mut pending = self.pending_keepalive.lock().await;
            let now = Instant::now();
            let keys: Vec<_> = pending
                .iter()
                .filter(|((gid, _), p)| gid == &group.group_id && p.due <= now)
                .map(|((_, aid), p)| (aid.clone(), p.clone()))
                .collect();
            for (aid, _) in &keys {
                pending.remove(&(group.group_id.clone(), aid.clone()));
            }
            keys
        };

        for (actor_id, entry) in due {
            if !unread_messages(group, &actor_id, 1).is_empty() {
                debug!(actor_id, "keepalive suppressed: inbox not empty");
                continue;
            }
            let (inflight, queued) = delivery.pending(&group.group_id, &actor_id).await;
            if inflight || queued > 0 {
                debug!(actor_id, "keepalive suppressed: handoff pending");
                continue;
            }
            let text = if entry.next_hint.is_empty() {
                "[cccc] keepalive: continue".to_string()
            } else {
                format!("[cccc] keepalive: continue: {}", entry.next_hint)
            };
            info!(group_id = %group.group_id, actor_id = %actor_id, "keepalive sent");
            pty_submit_text(supervisor, group, &actor_id, &text, false).await;
        }
    }

    /// Number of scheduled keep-alives (test hook).
    #[cfg(test)]
    async fn pending_count(&self) -> usize {
        self.pending_keepalive.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cccc_core::actor::{NewActor, add_actor};
    use cccc_core::registry::Registry;

    fn group() -> (tempfile::TempDir, Group) {
        let home = tempfile::tempdir().unwrap();
        let mut reg = Registry::load(home.path()).unwrap();
        let mut group = cccc_core::group::create_group(home.path(), &mut reg, "g", "").unwrap();
        add_actor(&mut group, NewActor { id: "lead".into(), enabled: true, ..Default::default() })
            .unwrap();
        add_actor(&mut group, NewActor { id: "peer-a".into(), enabled: true, ..Default::default() })
            .unwrap();
        (home, group)
    }

    #[test]
    fn progress_and_next_lines_are_detected() {
        assert!(has_progress_line("Progress: built the parser"));
        assert!(has_progress_line("- Progress (50%): halfway"));
        assert!(has_progress_line("  * progress: lowercase too"));
        assert!(!has_progress_line("no progress markers here"));
        assert!(!has_progress_line("Progressive enhancement"));

        assert_eq!(
            extract_next_hint("Progress: done\nNext: wire the tests"),
            Some("wire the tests".to_string())
        );
        assert_eq!(
            extract_next_hint("Next: first\n- Next: the last one wins"),
            Some("the last one wins".to_string())
        );
        assert_eq!(extract_next_hint("nothing"), None);
    }

    #[tokio::test]
    async fn keepalive_only_scheduled_for_peer_progress() {
        let (_home, group) = group();
        let automation = AutomationManager::new();

        automation.maybe_schedule_keepalive(&group, "user", "Progress: x").await;
        assert_eq!(automation.pending_count().await, 0);

        automation.maybe_schedule_keepalive(&group, "peer-a", "no marker").await;
        assert_eq!(automation.pending_count().await, 0);

        automation
            .maybe_schedule_keepalive(&group, "peer-a", "Progress: x\nNext: keep going")
            .await;
        assert_eq!(automation.pending_count().await, 1);
    }

    #[tokio::test]
    async fn self_check_counts_persist() {
        let (_home, mut group) = group();
        group.doc.delivery.self_check_every_handoffs = 2;
        group.doc.delivery.system_refresh_every_self_checks = 0;
        let automation = AutomationManager::new();
        let supervisor = PtySupervisor::new();

        for _ in 0..5 {
            automation
                .on_delivered_message(&group, &supervisor, "peer-a", "lead")
                .await;
        }
        let doc = load_state(&group);
        let state = doc.actors.get("peer-a").unwrap();
        assert_eq!(state.handoff_count, 5);
        assert_eq!(state.self_check_count, 2);
    }

    #[tokio::test]
    async fn system_sender_does_not_count() {
        let (_home, group) = group();
        let automation = AutomationManager::new();
        let supervisor = PtySupervisor::new();
        automation
            .on_delivered_message(&group, &supervisor, "peer-a", "system")
            .await;
        let doc = load_state(&group);
        assert!(doc.actors.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stale_unread_messages_nudge_once_per_event() {
        use std::io::Write;

        let (_home, mut group) = group();
        group.doc.delivery.nudge_after_seconds = 60;
        let automation = AutomationManager::new();
        let supervisor = std::sync::Arc::new(PtySupervisor::new());
        let delivery = DeliveryManager::new();

        let cwd = tempfile::tempdir().unwrap();
        if supervisor
            .start_actor(&group.group_id, "peer-a", cwd.path(), &["sleep".into(), "10".into()], &Default::default(), 0)
            .is_err()
        {
            eprintln!("skipping nudge test: no pty available");
            return;
        }

        // An unread message old enough to trip the nudge threshold.
        let stale = serde_json::json!({
            "v": 1, "id": "stale0001", "ts": "2020-01-01T00:00:00Z",
            "kind": "chat.message", "group_id": group.group_id,
            "scope_key": "", "by": "user",
            "data": {"text": "still waiting", "to": ["peer-a"]},
        });
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(group.ledger_path())
            .unwrap();
        writeln!(file, "{stale}").unwrap();

        automation.tick_group(&group, &supervisor, &delivery).await;
        let state = load_state(&group);
        assert_eq!(state.actors.get("peer-a").unwrap().last_nudge_event_id, "stale0001");
        let first_nudge_at = state.actors.get("peer-a").unwrap().last_nudge_at.clone();

        // The same head event never nudges twice.
        automation.tick_group(&group, &supervisor, &delivery).await;
        let state = load_state(&group);
        assert_eq!(state.actors.get("peer-a").unwrap().last_nudge_at, first_nudge_at);

        // The nudge was mirrored into the ledger as a system notification.
        let events = cccc_core::ledger::iter_events(&group.ledger_path());
        let notifies: Vec<_> = events.iter().filter(|e| e.kind == "system.notify").collect();
        assert_eq!(notifies.len(), 1);
        assert_eq!(notifies[0].data["kind"], "nudge");
        assert_eq!(notifies[0].data["target_actor_id"], "peer-a");

        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn disabled_nudge_cadence_is_a_noop() {
        let (_home, mut group) = group();
        group.doc.delivery.nudge_after_seconds = 0; // disabled
        let automation = AutomationManager::new();
        let supervisor = PtySupervisor::new();
        let delivery = DeliveryManager::new();
        // Disabled cadence is a no-op even with unread messages.
        cccc_core::ledger::append_event(
            &group.ledger_path(),
            "chat.message",
            &group.group_id,
            "",
            "user",
            serde_json::json!({"text": "hello", "to": ["peer-a"]}),
        )
        .unwrap();
        automation.tick_group(&group, &supervisor, &delivery).await;
        let doc = load_state(&group);
        assert!(doc.actors.is_empty());
    }
}
