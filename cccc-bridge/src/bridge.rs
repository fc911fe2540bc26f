//! Bridge core: cursor-tailed outbound pipeline + inbound normalizer.
//!
//! Outbound: tail the group ledger with a (dev, ino, offset) cursor that
//! survives restarts and detects rotation/truncation, filter events per
//! subscriber, format through the adapter, send.
//!
//! Inbound: adapter messages become commands or `chat.message` events; all
//! writes go through the daemon IPC — the bridge never mutates group state
//! directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use cccc_core::event::Event;
use cccc_core::fsutil::{atomic_write_json, read_json_or_default};
use cccc_core::group::Group;
use cccc_core::ipc::{DaemonRequest, DaemonResponse, call_daemon};

use crate::adapters::{Dedup, ImAdapter, NormalizedMessage};
use crate::commands::{
    CommandType, format_context, format_help, format_status, parse_message,
};
use crate::subscribers::SubscriberManager;

const OUTBOUND_INTERVAL: Duration = Duration::from_secs(1);
const INBOUND_WAIT: Duration = Duration::from_millis(500);
/// A ledger younger than this at first sight is replayed from the start.
const FRESH_LEDGER_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
struct CursorDoc {
    dev: Option<u64>,
    ino: Option<u64>,
    offset: u64,
}

/// Cursor-tailed reader over `ledger.jsonl`.
///
/// The cursor only ever advances past complete (`\n`-terminated) lines; a
/// partial trailing line is left unconsumed and re-read on the next poll, so
/// a writer crash mid-line can never corrupt or skip events.
pub struct LedgerWatcher {
    ledger_path: PathBuf,
    cursor_path: PathBuf,
    cursor: CursorDoc,
}

impl LedgerWatcher {
    pub fn new(group_path: &Path) -> Self {
        let cursor_path = group_path.join("state").join("im_bridge_cursor.json");
        let cursor: CursorDoc = read_json_or_default(&cursor_path);
        Self {
            ledger_path: group_path.join("ledger.jsonl"),
            cursor_path,
            cursor,
        }
    }

    fn save_cursor(&self) {
        let _ = atomic_write_json(&self.cursor_path, &self.cursor);
    }

    /// Read any complete new lines since the last poll.
    pub fn poll(&mut self) -> Vec<Event> {
        let Ok(meta) = std::fs::metadata(&self.ledger_path) else {
            return Vec::new();
        };
        use std::os::unix::fs::MetadataExt;
        let (dev, ino, size) = (meta.dev(), meta.ino(), meta.len());

        let rotated = self.cursor.dev != Some(dev)
            || self.cursor.ino != Some(ino)
            || self.cursor.offset > size;
        if rotated {
            if self.cursor.dev.is_none() {
                // First run: replay only when the ledger itself is brand new;
                // otherwise start at the current end.
                let fresh = meta
                    .modified()
                    .ok()
                    .and_then(|m| m.elapsed().ok())
                    .is_some_and(|age| age <= FRESH_LEDGER_WINDOW);
                self.cursor.offset = if fresh { 0 } else { size };
            } else {
                self.cursor.offset = size;
            }
            self.cursor.dev = Some(dev);
            self.cursor.ino = Some(ino);
            self.save_cursor();
        }

        if size <= self.cursor.offset {
            return Vec::new();
        }

        use std::io::{Read, Seek, SeekFrom};
        let Ok(mut file) = std::fs::File::open(&self.ledger_path) else {
            return Vec::new();
        };
        if file.seek(SeekFrom::Start(self.cursor.offset)).is_err() {
            return Vec::new();
        }
        let mut chunk = Vec::new();
        if file.read_to_end(&mut chunk).is_err() {
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut consumed = 0usize;
        while let Some(newline) = chunk[consumed..].iter().position(|&b| b == b'\n') {
            let line = &chunk[consumed..consumed + newline];
            consumed += newline + 1;
            let text = String::from_utf8_lossy(line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            if let Ok(event) = serde_json::from_str::<Event>(text) {
                events.push(event);
            }
        }
        self.cursor.offset += consumed as u64;
        self.save_cursor();
        events
    }
}

pub struct Bridge {
    home: PathBuf,
    group_id: String,
    adapter: Arc<dyn ImAdapter>,
    subscribers: SubscriberManager,
    watcher: LedgerWatcher,
    dedup: Dedup,
    running: Arc<AtomicBool>,
}

impl Bridge {
    pub fn new(home: PathBuf, group: &Group, adapter: Arc<dyn ImAdapter>) -> Self {
        Self {
            home,
            group_id: group.group_id.clone(),
            adapter,
            subscribers: SubscriberManager::load(&group.state_dir()),
            watcher: LedgerWatcher::new(&group.path),
            dedup: Dedup::default(),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    fn daemon(&self, op: &str, args: Value) -> DaemonResponse {
        let sock = cccc_core::paths::socket_path(&self.home);
        call_daemon(&sock, &DaemonRequest::new(op, args))
    }

    fn load_group(&self) -> Option<Group> {
        cccc_core::group::load_group(&self.home, &self.group_id)
    }

    /// Run until the stop handle flips. The adapter polls on its own thread
    /// (it may long-poll for many seconds) and feeds the main loop through a
    /// channel.
    pub fn run(&mut self) -> anyhow::Result<()> {
        if !self.adapter.connect() {
            anyhow::bail!("failed to connect {} adapter", self.adapter.platform());
        }
        self.running.store(true, Ordering::SeqCst);
        info!(group_id = %self.group_id, platform = self.adapter.platform(), "bridge started");

        let (tx, rx) = std::sync::mpsc::channel::<NormalizedMessage>();
        let poll_adapter = self.adapter.clone();
        let poll_running = self.running.clone();
        let poller = std::thread::spawn(move || {
            while poll_running.load(Ordering::SeqCst) {
                let messages = poll_adapter.poll();
                if messages.is_empty() {
                    // Non-long-polling adapters would spin without this.
                    std::thread::sleep(Duration::from_millis(500));
                    continue;
                }
                for message in messages {
                    if tx.send(message).is_err() {
                        return;
                    }
                }
            }
        });

        let mut last_outbound: Option<Instant> = None;
        while self.running.load(Ordering::SeqCst) {
            match rx.recv_timeout(INBOUND_WAIT) {
                Ok(message) => self.handle_inbound(message),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if last_outbound.is_none_or(|at| at.elapsed() >= OUTBOUND_INTERVAL) {
                self.process_outbound();
                last_outbound = Some(Instant::now());
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.adapter.disconnect();
        let _ = poller.join();
        info!("bridge stopped");
        Ok(())
    }

    // --- outbound ------------------------------------------------------------

    fn process_outbound(&mut self) {
        for event in self.watcher.poll() {
            self.forward_event(&event);
        }
    }

    /// Forward one ledger event to every subscribed chat that wants it.
    fn forward_event(&self, event: &Event) {
        // User messages came from IM/Web/CLI in the first place; echoing
        // them back would duplicate the conversation.
        if event.by == "user" {
            return;
        }
        let is_system = event.kind == "system.notify";
        let is_chat = event.kind == "chat.message";
        if !is_system && !is_chat {
            return;
        }

        let text = event.data["text"]
            .as_str()
            .or(event.data["message"].as_str())
            .unwrap_or("");
        if text.is_empty() {
            return;
        }
        let to: Vec<String> = event.data["to"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let attachments: Vec<&Value> = event.data["attachments"]
            .as_array()
            .map(|arr| arr.iter().collect())
            .unwrap_or_default();
        let group = if attachments.is_empty() { None } else { self.load_group() };

        for sub in self.subscribers.subscribed_targets() {
            let wanted = is_system
                || sub.verbose
                || to.is_empty()
                || to.iter().any(|t| t == "user");
            if !wanted {
                continue;
            }
            let formatted = self
                .adapter
                .format_outbound(&event.by, &to, text, is_system);
            self.adapter
                .send_message(&sub.chat_id, &formatted, sub.thread_id);

            // Stream any stored blobs to the platform alongside the text.
            if let Some(group) = group.as_ref() {
                for attachment in &attachments {
                    let Some(rel) = attachment["path"].as_str() else { continue };
                    let Ok(abs) = cccc_core::blobs::resolve_blob_attachment_path(group, rel) else {
                        continue;
                    };
                    let filename = attachment["title"].as_str().unwrap_or("file");
                    if !self
                        .adapter
                        .send_file(&sub.chat_id, &abs, filename, "", sub.thread_id)
                    {
                        debug!(filename, "adapter declined file send");
                    }
                }
            }
        }
    }

    // --- inbound -------------------------------------------------------------

    fn handle_inbound(&mut self, msg: NormalizedMessage) {
        if msg.text.is_empty() {
            return;
        }
        if !self.dedup.first_sighting(&msg.chat_id, &msg.message_id) {
            debug!(chat_id = %msg.chat_id, message_id = %msg.message_id, "duplicate message dropped");
            return;
        }

        let parsed = parse_message(&msg.text);
        let chat_id = msg.chat_id.clone();
        let thread_id = msg.thread_id;

        match parsed.command {
            CommandType::Subscribe => self.handle_subscribe(&msg),
            CommandType::Unsubscribe => {
                let was = self.subscribers.unsubscribe(&chat_id, thread_id);
                let reply = if was {
                    "👋 Unsubscribed. You will no longer receive messages."
                } else {
                    "ℹ️ You were not subscribed."
                };
                self.adapter.send_message(&chat_id, reply, thread_id);
            }
            CommandType::Verbose => {
                let reply = match self.subscribers.toggle_verbose(&chat_id, thread_id) {
                    None => "ℹ️ Please /subscribe first.".to_string(),
                    Some(true) => "👁 Verbose mode: ON - showing all messages".to_string(),
                    Some(false) => {
                        "👁 Verbose mode: OFF - showing only messages to you".to_string()
                    }
                };
                self.adapter.send_message(&chat_id, &reply, thread_id);
            }
            CommandType::Status => self.handle_status(&chat_id, thread_id),
            CommandType::Context => self.handle_context(&chat_id, thread_id),
            CommandType::Pause => self.handle_set_state(&chat_id, thread_id, "paused"),
            CommandType::Resume => self.handle_set_state(&chat_id, thread_id, "active"),
            CommandType::Launch => self.handle_control(&chat_id, thread_id, "group_start", "🚀 Launching all agents..."),
            CommandType::Quit => self.handle_control(&chat_id, thread_id, "group_stop", "🛑 Stopping all agents..."),
            CommandType::Help => {
                self.adapter
                    .send_message(&chat_id, &format_help(self.adapter.platform()), thread_id);
            }
            CommandType::Send => {
                self.handle_content(&msg, &parsed.text, &parsed.mentions);
            }
            CommandType::Message => {
                let is_private = msg.chat_type == "private" || msg.chat_type.is_empty();
                if msg.text.trim_start().starts_with('/') {
                    // Unknown slash command: reply only where we are clearly
                    // being addressed, never forward as chat content.
                    if msg.routed || is_private {
                        self.adapter.send_message(
                            &chat_id,
                            "❓ Unknown command. Use /help.",
                            thread_id,
                        );
                    }
                    return;
                }
                // In shared chats, only routed messages reach the ledger.
                if !is_private && !msg.routed {
                    return;
                }
                self.handle_content(&msg, &parsed.text, &parsed.mentions);
            }
        }
    }

    fn handle_subscribe(&mut self, msg: &NormalizedMessage) {
        let title = if msg.chat_title.is_empty() {
            self.adapter.get_chat_title(&msg.chat_id)
        } else {
            msg.chat_title.clone()
        };
        let sub = self.subscribers.subscribe(&msg.chat_id, &title, msg.thread_id);
        let verbose = if sub.verbose { "on" } else { "off" };
        let group_title = self
            .load_group()
            .map(|g| g.doc.title)
            .unwrap_or_else(|| self.group_id.clone());
        let tip = match self.adapter.platform() {
            "slack" | "discord" => "Channel tip: mention the bot (e.g. @bot hello) to talk to agents.",
            _ => "Group tip: use /send <message> to talk to agents.",
        };
        let reply = format!(
            "✅ Subscribed to {group_title}\nVerbose mode: {verbose}\n{tip}\nUse /help for commands."
        );
        self.adapter.send_message(&msg.chat_id, &reply, msg.thread_id);
    }

    fn handle_status(&self, chat_id: &str, thread_id: i64) {
        let show = self.daemon("group_show", serde_json::json!({"group_id": self.group_id}));
        if !show.ok {
            self.adapter.send_message(chat_id, "❌ Failed to get status", thread_id);
            return;
        }
        let group = &show.result["group"];
        let actors = self
            .daemon("actor_list", serde_json::json!({"group_id": self.group_id}))
            .result["actors"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let text = format_status(
            group["title"].as_str().unwrap_or(&self.group_id),
            group["state"].as_str().unwrap_or("active"),
            show.result["running"].as_bool().unwrap_or(false),
            &actors,
        );
        self.adapter.send_message(chat_id, &text, thread_id);
    }

    fn handle_context(&self, chat_id: &str, thread_id: i64) {
        let resp = self.daemon("context_get", serde_json::json!({"group_id": self.group_id}));
        if !resp.ok {
            self.adapter.send_message(chat_id, "❌ Failed to get context", thread_id);
            return;
        }
        let text = format_context(&resp.result["context"]);
        self.adapter.send_message(chat_id, &text, thread_id);
    }

    fn handle_set_state(&self, chat_id: &str, thread_id: i64, state: &str) {
        let resp = self.daemon(
            "group_set_state",
            serde_json::json!({"group_id": self.group_id, "state": state, "by": "user"}),
        );
        let reply = if resp.ok {
            match state {
                "paused" => "⏸ Group paused. Message delivery stopped.".to_string(),
                _ => "▶️ Group resumed. Message delivery active.".to_string(),
            }
        } else {
            format!("❌ Failed: {}", error_message(&resp))
        };
        self.adapter.send_message(chat_id, &reply, thread_id);
    }

    fn handle_control(&self, chat_id: &str, thread_id: i64, op: &str, ok_reply: &str) {
        let resp = self.daemon(op, serde_json::json!({"group_id": self.group_id, "by": "user"}));
        let reply = if resp.ok {
            ok_reply.to_string()
        } else {
            format!("❌ Failed: {}", error_message(&resp))
        };
        self.adapter.send_message(chat_id, &reply, thread_id);
    }

    /// Forward chat content into the ledger via the daemon, storing any
    /// attachments as blobs first.
    fn handle_content(&self, msg: &NormalizedMessage, text: &str, mentions: &[String]) {
        if text.trim().is_empty() && msg.attachments.is_empty() {
            return;
        }

        let mut stored: Vec<Value> = Vec::new();
        if !msg.attachments.is_empty() {
            if let Some(group) = self.load_group() {
                for attachment in &msg.attachments {
                    match self.adapter.download_attachment(attachment) {
                        Ok(bytes) => {
                            let filename = attachment["file_name"].as_str().unwrap_or("file");
                            let mime = attachment["mime_type"].as_str().unwrap_or("");
                            match cccc_core::blobs::store_blob_bytes(&group, &bytes, filename, mime)
                            {
                                Ok(descriptor) => stored.push(descriptor),
                                Err(e) => warn!(err = %e, "failed to store attachment blob"),
                            }
                        }
                        Err(e) => warn!(err = %e, "failed to download attachment"),
                    }
                }
            }
        }

        let resp = self.daemon(
            "send",
            serde_json::json!({
                "group_id": self.group_id,
                "text": text,
                "by": "user",
                "to": mentions,
                "path": "",
                "attachments": stored,
            }),
        );
        if !resp.ok {
            self.adapter.send_message(
                &msg.chat_id,
                &format!("❌ Failed to send: {}", error_message(&resp)),
                msg.thread_id,
            );
        }
    }
}

fn error_message(resp: &DaemonResponse) -> String {
    resp.error
        .as_ref()
        .map(|e| e.message.clone())
        .unwrap_or_else(|| "unknown error".to_string())
}
