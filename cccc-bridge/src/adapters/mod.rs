//! Platform adapter contract.
//!
//! Every IM platform plugs into the bridge through this trait; the bridge
//! core stays platform-agnostic. Adapters normalize inbound traffic into
//! [`NormalizedMessage`] and are responsible for fitting outbound text under
//! their platform's hard length caps (via [`summarize`]) before sending.

pub mod discord;
pub mod slack;
pub mod telegram;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::info;

/// A platform message normalized for the bridge core.
#[derive(Debug, Clone, Default)]
pub struct NormalizedMessage {
    pub chat_id: String,
    pub chat_title: String,
    /// "private", "group", or "channel".
    pub chat_type: String,
    pub thread_id: i64,
    pub text: String,
    pub attachments: Vec<Value>,
    pub from_user: String,
    pub message_id: String,
    /// True when the platform confirmed the message was addressed to the bot
    /// (private chat, explicit mention, slash command, or platform
    /// convention).
    pub routed: bool,
}

pub trait ImAdapter: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Establish the platform session. False means the bridge must not start.
    fn connect(&self) -> bool;

    fn disconnect(&self);

    /// Return inbound messages received since the last call. May long-poll.
    fn poll(&self) -> Vec<NormalizedMessage>;

    /// Send a text message. `thread_id` 0 means no thread.
    fn send_message(&self, chat_id: &str, text: &str, thread_id: i64) -> bool;

    fn send_file(
        &self,
        chat_id: &str,
        file_path: &Path,
        filename: &str,
        caption: &str,
        thread_id: i64,
    ) -> bool {
        let _ = (chat_id, file_path, filename, caption, thread_id);
        false
    }

    fn get_chat_title(&self, chat_id: &str) -> String {
        chat_id.to_string()
    }

    fn download_attachment(&self, attachment: &Value) -> anyhow::Result<Vec<u8>> {
        let _ = attachment;
        anyhow::bail!("attachments not supported on {}", self.platform())
    }

    /// Format an outbound ledger event for display.
    fn format_outbound(&self, by: &str, to: &[String], text: &str, is_system: bool) -> String {
        format_outbound_default(by, to, text, is_system)
    }

    fn summarize(&self, text: &str, max_chars: usize, max_lines: usize) -> String {
        summarize_default(text, max_chars, max_lines)
    }
}

/// `[SYSTEM] …` for notifications, `[by] …` to the user, `[by → targets] …`
/// for agent-to-agent traffic (shown in verbose mode).
pub fn format_outbound_default(by: &str, to: &[String], text: &str, is_system: bool) -> String {
    if is_system {
        return format!("[SYSTEM] {text}");
    }
    if !to.is_empty() && !to.iter().any(|t| t == "user") {
        format!("[{by} → {}] {text}", to.join(", "))
    } else {
        format!("[{by}] {text}")
    }
}

/// Collapse blank runs, cap lines and characters (with an ellipsis).
pub fn summarize_default(text: &str, max_chars: usize, max_lines: usize) -> String {
    if text.is_empty() {
        return String::new();
    }
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n").replace('\t', "  ");
    let mut lines: Vec<&str> = normalized.split('\n').map(|l| l.trim_end()).collect();

    while lines.first().is_some_and(|l| l.trim().is_empty()) {
        lines.remove(0);
    }
    while lines.last().is_some_and(|l| l.trim().is_empty()) {
        lines.pop();
    }

    let mut kept: Vec<&str> = Vec::new();
    let mut blanks = 0usize;
    for line in lines {
        if line.trim().is_empty() {
            blanks += 1;
            if blanks <= 1 {
                kept.push("");
            }
        } else {
            blanks = 0;
            kept.push(line);
        }
    }
    kept.truncate(max_lines);

    let mut out = kept.join("\n").trim().to_string();
    if out.chars().count() > max_chars {
        out = out.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
    }
    out
}

/// Platform send-rate ceilings (messages per second, per chat).
pub fn platform_rate_limit(platform: &str) -> f64 {
    match platform {
        "telegram" => 1.0,
        "feishu" | "dingtalk" => 5.0,
        _ => 1.0,
    }
}

/// Per-chat send pacing: `acquire` returns how long to wait, `wait_and_acquire`
/// sleeps it off. One limiter per adapter.
pub struct RateLimiter {
    min_interval: Duration,
    last_send: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(max_per_second: f64) -> Self {
        Self {
            min_interval: Duration::from_secs_f64(1.0 / max_per_second.max(0.01)),
            last_send: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, chat_id: &str) -> Duration {
        let mut last = self.last_send.lock().expect("rate limiter lock");
        let now = Instant::now();
        match last.get(chat_id) {
            Some(&prev) if now.duration_since(prev) < self.min_interval => {
                self.min_interval - now.duration_since(prev)
            }
            _ => {
                last.insert(chat_id.to_string(), now);
                Duration::ZERO
            }
        }
    }

    pub fn wait_and_acquire(&self, chat_id: &str) {
        let wait = self.acquire(chat_id);
        if !wait.is_zero() {
            std::thread::sleep(wait);
            let _ = self.acquire(chat_id);
        }
    }
}

/// Replay-safe message dedup for platforms whose stream SDKs redeliver on
/// reconnect. Keyed `conversation_id:message_id`; entries expire after 1 h.
pub struct Dedup {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl Default for Dedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl Dedup {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True the first time a (conversation, message) pair is seen.
    pub fn first_sighting(&self, conversation_id: &str, message_id: &str) -> bool {
        if message_id.is_empty() {
            return true;
        }
        let key = format!("{conversation_id}:{message_id}");
        let mut seen = self.seen.lock().expect("dedup lock");
        let now = Instant::now();
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now);
        if seen.len() > 2048 {
            let ttl = self.ttl;
            seen.retain(|_, &mut at| now.duration_since(at) < ttl);
        }
        true
    }
}

/// Log-only adapter for tests and dry runs.
#[derive(Default)]
pub struct ConsoleAdapter {
    pub sent: Mutex<Vec<(String, String, i64)>>,
    pub files: Mutex<Vec<(String, String)>>,
}

impl ImAdapter for ConsoleAdapter {
    fn platform(&self) -> &'static str {
        "console"
    }

    fn connect(&self) -> bool {
        true
    }

    fn disconnect(&self) {}

    fn poll(&self) -> Vec<NormalizedMessage> {
        Vec::new()
    }

    fn send_message(&self, chat_id: &str, text: &str, thread_id: i64) -> bool {
        info!(chat_id, thread_id, "console adapter send: {text}");
        self.sent
            .lock()
            .expect("console adapter lock")
            .push((chat_id.to_string(), text.to_string(), thread_id));
        true
    }

    fn send_file(
        &self,
        chat_id: &str,
        file_path: &Path,
        filename: &str,
        _caption: &str,
        _thread_id: i64,
    ) -> bool {
        info!(chat_id, filename, path = %file_path.display(), "console adapter file send");
        self.files
            .lock()
            .expect("console adapter lock")
            .push((chat_id.to_string(), filename.to_string()));
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_format_variants() {
        assert_eq!(
            format_outbound_default("peer-a", &[], "hi", false),
            "[peer-a] hi"
        );
        assert_eq!(
            format_outbound_default("peer-a", &["user".to_string()], "hi", false),
            "[peer-a] hi"
        );
        assert_eq!(
            format_outbound_default("peer-a", &["lead".to_string(), "peer-b".to_string()], "hi", false),
            "[peer-a → lead, peer-b] hi"
        );
        assert_eq!(format_outbound_default("x", &[], "boom", true), "[SYSTEM] boom");
    }

    #[test]
    fn summarize_collapses_and_caps() {
        let text = "\n\nfirst\n\n\n\nsecond\nthird\nfourth\n\n";
        let out = summarize_default(text, 1000, 3);
        assert_eq!(out, "first\n\nsecond");

        let long = "x".repeat(50);
        let out = summarize_default(&long, 10, 10);
        assert_eq!(out.chars().count(), 10);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn platform_rate_defaults() {
        assert_eq!(platform_rate_limit("telegram"), 1.0);
        assert_eq!(platform_rate_limit("feishu"), 5.0);
        assert_eq!(platform_rate_limit("dingtalk"), 5.0);
        assert_eq!(platform_rate_limit("anything-else"), 1.0);
    }

    #[test]
    fn rate_limiter_spaces_out_same_chat() {
        let limiter = RateLimiter::new(10.0); // 100ms interval
        assert!(limiter.acquire("c1").is_zero());
        assert!(!limiter.acquire("c1").is_zero());
        // Different chat is unaffected.
        assert!(limiter.acquire("c2").is_zero());
    }

    #[test]
    fn dedup_accepts_first_and_rejects_replay() {
        let dedup = Dedup::default();
        assert!(dedup.first_sighting("conv", "m1"));
        assert!(!dedup.first_sighting("conv", "m1"));
        assert!(dedup.first_sighting("conv", "m2"));
        assert!(dedup.first_sighting("other", "m1"));
        // Messages without ids are never suppressed.
        assert!(dedup.first_sighting("conv", ""));
        assert!(dedup.first_sighting("conv", ""));
    }
}
