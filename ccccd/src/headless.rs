//! Headless runner: MCP-driven actors without a terminal.
//!
//! A headless session is daemon-side bookkeeping only — there is no child
//! process to supervise. The agent drives its own loop through daemon ops
//! (`headless_set_status`, `headless_ack_message`); targeted messages reach
//! it through the file mailbox. Status transitions:
//! idle → working → waiting → (idle | stopped).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use cccc_core::timeutil::utc_now_iso;

pub const HEADLESS_STATUSES: &[&str] = &["idle", "working", "waiting", "stopped"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessState {
    pub v: u32,
    pub group_id: String,
    pub actor_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

#[derive(Debug)]
struct HeadlessSession {
    state: HeadlessState,
    running: bool,
}

impl HeadlessSession {
    fn new(group_id: &str, actor_id: &str) -> Self {
        let now = utc_now_iso();
        Self {
            state: HeadlessState {
                v: 1,
                group_id: group_id.to_string(),
                actor_id: actor_id.to_string(),
                status: "idle".to_string(),
                current_task_id: None,
                last_message_id: None,
                started_at: now.clone(),
                updated_at: now,
            },
            running: true,
        }
    }

    fn is_running(&self) -> bool {
        self.running && self.state.status != "stopped"
    }
}

#[derive(Default)]
pub struct HeadlessSupervisor {
    sessions: Mutex<HashMap<(String, String), Arc<Mutex<HeadlessSession>>>>,
}

impl HeadlessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn session(&self, group_id: &str, actor_id: &str) -> Option<Arc<Mutex<HeadlessSession>>> {
        let key = (group_id.trim().to_string(), actor_id.trim().to_string());
        self.sessions.lock().expect("sessions lock").get(&key).cloned()
    }

    pub fn actor_running(&self, group_id: &str, actor_id: &str) -> bool {
        self.session(group_id, actor_id)
            .is_some_and(|s| s.lock().expect("session lock").is_running())
    }

    pub fn group_running(&self, group_id: &str) -> bool {
        let gid = group_id.trim();
        if gid.is_empty() {
            return false;
        }
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .any(|((g, _), s)| g == gid && s.lock().expect("session lock").is_running())
    }

    /// Register a headless session (idempotent while running).
    pub fn start_actor(&self, group_id: &str, actor_id: &str) -> HeadlessState {
        let key = (group_id.trim().to_string(), actor_id.trim().to_string());
        let mut sessions = self.sessions.lock().expect("sessions lock");
        if let Some(existing) = sessions.get(&key) {
            let guard = existing.lock().expect("session lock");
            if guard.is_running() {
                return guard.state.clone();
            }
        }
        let session = Arc::new(Mutex::new(HeadlessSession::new(&key.0, &key.1)));
        let state = session.lock().expect("session lock").state.clone();
        sessions.insert(key, session);
        state
    }

    pub fn stop_actor(&self, group_id: &str, actor_id: &str) {
        let key = (group_id.trim().to_string(), actor_id.trim().to_string());
        if let Some(session) = self.sessions.lock().expect("sessions lock").remove(&key) {
            let mut guard = session.lock().expect("session lock");
            guard.running = false;
            guard.state.status = "stopped".to_string();
            guard.state.updated_at = utc_now_iso();
        }
    }

    pub fn stop_group(&self, group_id: &str) {
        let gid = group_id.trim().to_string();
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let keys: Vec<_> = sessions.keys().filter(|(g, _)| g == &gid).cloned().collect();
            keys.into_iter().filter_map(|k| sessions.remove(&k)).collect()
        };
        for session in drained {
            let mut guard = session.lock().expect("session lock");
            guard.running = false;
            guard.state.status = "stopped".to_string();
        }
    }

    pub fn stop_all(&self) {
        let drained: Vec<_> = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            let mut guard = session.lock().expect("session lock");
            guard.running = false;
            guard.state.status = "stopped".to_string();
        }
    }

    pub fn get_state(&self, group_id: &str, actor_id: &str) -> Option<HeadlessState> {
        self.session(group_id, actor_id)
            .map(|s| s.lock().expect("session lock").state.clone())
    }

    /// Update a session's status. False when no session exists.
    pub fn set_status(
        &self,
        group_id: &str,
        actor_id: &str,
        status: &str,
        task_id: Option<&str>,
    ) -> bool {
        let Some(session) = self.session(group_id, actor_id) else {
            return false;
        };
        let mut guard = session.lock().expect("session lock");
        guard.state.status = status.to_string();
        guard.state.updated_at = utc_now_iso();
        if let Some(task_id) = task_id {
            guard.state.current_task_id = Some(task_id.to_string());
        }
        if status == "stopped" {
            guard.running = false;
        }
        true
    }

    /// Record the last processed message id. False when no session exists.
    pub fn set_last_message(&self, group_id: &str, actor_id: &str, message_id: &str) -> bool {
        let Some(session) = self.session(group_id, actor_id) else {
            return false;
        };
        let mut guard = session.lock().expect("session lock");
        guard.state.last_message_id = Some(message_id.to_string());
        guard.state.updated_at = utc_now_iso();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_is_idempotent_while_running() {
        let supervisor = HeadlessSupervisor::new();
        let first = supervisor.start_actor("g", "mcp-1");
        assert_eq!(first.status, "idle");
        supervisor.set_status("g", "mcp-1", "working", Some("task-9"));
        // Restarting a live session keeps its state.
        let again = supervisor.start_actor("g", "mcp-1");
        assert_eq!(again.status, "working");
        assert_eq!(again.current_task_id.as_deref(), Some("task-9"));
    }

    #[test]
    fn status_and_ack_round_trip() {
        let supervisor = HeadlessSupervisor::new();
        supervisor.start_actor("g", "mcp-1");
        assert!(supervisor.actor_running("g", "mcp-1"));
        assert!(supervisor.group_running("g"));

        assert!(supervisor.set_last_message("g", "mcp-1", "ev123"));
        let state = supervisor.get_state("g", "mcp-1").unwrap();
        assert_eq!(state.last_message_id.as_deref(), Some("ev123"));

        assert!(supervisor.set_status("g", "mcp-1", "stopped", None));
        assert!(!supervisor.actor_running("g", "mcp-1"));
    }

    #[test]
    fn unknown_sessions_report_false() {
        let supervisor = HeadlessSupervisor::new();
        assert!(!supervisor.set_status("g", "ghost", "working", None));
        assert!(!supervisor.set_last_message("g", "ghost", "x"));
        assert!(supervisor.get_state("g", "ghost").is_none());
    }

    #[test]
    fn stop_group_only_touches_that_group() {
        let supervisor = HeadlessSupervisor::new();
        supervisor.start_actor("g1", "a");
        supervisor.start_actor("g2", "b");
        supervisor.stop_group("g1");
        assert!(!supervisor.group_running("g1"));
        assert!(supervisor.group_running("g2"));
    }
}
