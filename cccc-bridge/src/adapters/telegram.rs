//! Telegram Bot API adapter.
//!
//! Long-polls `getUpdates` for inbound traffic (25 s server-side wait) and
//! posts `sendMessage`/`sendDocument` for outbound. Telegram allows roughly
//! one message per second per chat, enforced here with the shared rate
//! limiter; messages are summarized and hard-capped at 4096 chars before
//! sending.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ImAdapter, NormalizedMessage, RateLimiter};

pub const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;
const API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_SECONDS: u64 = 25;

pub struct TelegramAdapter {
    token: String,
    client: Client,
    rate_limiter: RateLimiter,
    /// getUpdates offset: one past the last update processed.
    offset: Mutex<i64>,
    bot_username: Mutex<String>,
    summarize_chars: usize,
    summarize_lines: usize,
}

impl TelegramAdapter {
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: Client::builder()
                .timeout(Duration::from_secs(LONG_POLL_SECONDS + 10))
                .build()
                .expect("reqwest client"),
            rate_limiter: RateLimiter::new(super::platform_rate_limit("telegram")),
            offset: Mutex::new(0),
            bot_username: Mutex::new(String::new()),
            summarize_chars: 3500,
            summarize_lines: 40,
        }
    }

    fn api(&self, method: &str, params: Value) -> Option<Value> {
        let url = format!("{API_BASE}/bot{}/{method}", self.token);
        let response = self.client.post(&url).json(&params).send().ok()?;
        let body: Value = response.json().ok()?;
        if body["ok"].as_bool() != Some(true) {
            debug!(method, desc = %body["description"], "telegram api returned ok=false");
            return None;
        }
        Some(body["result"].clone())
    }

    fn compose_safe(&self, text: &str) -> String {
        let summarized = self.summarize(text, self.summarize_chars, self.summarize_lines);
        if summarized.chars().count() > TELEGRAM_MAX_MESSAGE_LENGTH {
            let mut out: String = summarized
                .chars()
                .take(TELEGRAM_MAX_MESSAGE_LENGTH - 1)
                .collect();
            out.push('…');
            out
        } else {
            summarized
        }
    }

    fn send_with_retry(&self, chat_id: &str, text: &str, thread_id: i64, retries: u32) -> bool {
        let mut params = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });
        if thread_id > 0 {
            params["message_thread_id"] = Value::from(thread_id);
        }
        for attempt in 0..=retries {
            if self.api("sendMessage", params.clone()).is_some() {
                return true;
            }
            if attempt < retries {
                std::thread::sleep(Duration::from_secs(1));
            }
        }
        warn!(chat_id, "telegram sendMessage failed");
        false
    }

    fn normalize_update(&self, update: &Value) -> Option<NormalizedMessage> {
        // Edited messages are ignored: reprocessing commands on edit would
        // double-deliver.
        let msg = update
            .get("message")
            .or_else(|| update.get("channel_post"))?;

        let mut attachments: Vec<Value> = Vec::new();
        if let Some(doc) = msg.get("document").filter(|d| d.is_object()) {
            attachments.push(serde_json::json!({
                "provider": "telegram",
                "kind": "file",
                "file_id": doc["file_id"].as_str().unwrap_or(""),
                "file_name": doc["file_name"].as_str().unwrap_or("file"),
                "mime_type": doc["mime_type"].as_str().unwrap_or(""),
                "bytes": doc["file_size"].as_u64().unwrap_or(0),
            }));
        } else if let Some(photos) = msg.get("photo").and_then(|p| p.as_array()) {
            // Telegram sends all sizes; the last is the largest.
            if let Some(photo) = photos.last() {
                let file_id = photo["file_id"].as_str().unwrap_or("");
                attachments.push(serde_json::json!({
                    "provider": "telegram",
                    "kind": "image",
                    "file_id": file_id,
                    "file_name": format!("photo_{file_id}.jpg"),
                    "mime_type": "image/jpeg",
                    "bytes": photo["file_size"].as_u64().unwrap_or(0),
                }));
            }
        }

        let text = msg["text"]
            .as_str()
            .or(msg["caption"].as_str())
            .unwrap_or("");
        if text.is_empty() {
            return None;
        }

        let chat = &msg["chat"];
        let chat_id = chat["id"].as_i64()?;
        let chat_type = chat["type"].as_str().unwrap_or("").to_string();
        let chat_title = chat["title"]
            .as_str()
            .or(chat["first_name"].as_str())
            .unwrap_or("")
            .to_string();
        let from_user = msg["from"]["username"]
            .as_str()
            .or(msg["from"]["first_name"].as_str())
            .unwrap_or("user")
            .to_string();

        // Routed when private, or when the bot is @-mentioned by name.
        let bot_name = self.bot_username.lock().expect("bot name lock").clone();
        let routed = chat_type == "private"
            || (!bot_name.is_empty() && text.to_lowercase().contains(&format!("@{}", bot_name.to_lowercase())));

        Some(NormalizedMessage {
            chat_id: chat_id.to_string(),
            chat_title,
            chat_type,
            thread_id: msg["message_thread_id"].as_i64().unwrap_or(0),
            text: text.to_string(),
            attachments,
            from_user,
            message_id: msg["message_id"]
                .as_i64()
                .map(|v| v.to_string())
                .unwrap_or_default(),
            routed,
        })
    }
}

impl ImAdapter for TelegramAdapter {
    fn platform(&self) -> &'static str {
        "telegram"
    }

    fn connect(&self) -> bool {
        match self.api("getMe", serde_json::json!({})) {
            Some(me) => {
                let username = me["username"].as_str().unwrap_or("").to_string();
                debug!(username = %username, "telegram bot connected");
                *self.bot_username.lock().expect("bot name lock") = username;
                true
            }
            None => false,
        }
    }

    fn disconnect(&self) {}

    fn poll(&self) -> Vec<NormalizedMessage> {
        let offset = *self.offset.lock().expect("offset lock");
        let Some(result) = self.api(
            "getUpdates",
            serde_json::json!({
                "offset": offset,
                "timeout": LONG_POLL_SECONDS,
                "allowed_updates": ["message", "channel_post"],
            }),
        ) else {
            return Vec::new();
        };

        let mut messages = Vec::new();
        for update in result.as_array().into_iter().flatten() {
            if let Some(update_id) = update["update_id"].as_i64() {
                let mut offset = self.offset.lock().expect("offset lock");
                *offset = (*offset).max(update_id + 1);
            }
            if let Some(message) = self.normalize_update(update) {
                messages.push(message);
            }
        }
        messages
    }

    fn send_message(&self, chat_id: &str, text: &str, thread_id: i64) -> bool {
        if text.is_empty() {
            return true;
        }
        let safe = self.compose_safe(text);
        self.rate_limiter.wait_and_acquire(chat_id);
        self.send_with_retry(chat_id, &safe, thread_id, 1)
    }

    fn send_file(
        &self,
        chat_id: &str,
        file_path: &Path,
        filename: &str,
        caption: &str,
        thread_id: i64,
    ) -> bool {
        let Ok(bytes) = std::fs::read(file_path) else {
            return false;
        };
        self.rate_limiter.wait_and_acquire(chat_id);

        let part = match reqwest::blocking::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("application/octet-stream")
        {
            Ok(part) => part,
            Err(_) => return false,
        };
        let mut form = reqwest::blocking::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", part);
        if !caption.is_empty() {
            form = form.text("caption", self.summarize(caption, 1000, 8));
        }
        if thread_id > 0 {
            form = form.text("message_thread_id", thread_id.to_string());
        }

        let url = format!("{API_BASE}/bot{}/sendDocument", self.token);
        match self.client.post(&url).multipart(form).send() {
            Ok(response) => response
                .json::<Value>()
                .ok()
                .and_then(|v| v["ok"].as_bool())
                .unwrap_or(false),
            Err(e) => {
                warn!(err = %e, "telegram sendDocument failed");
                false
            }
        }
    }

    fn get_chat_title(&self, chat_id: &str) -> String {
        self.api("getChat", serde_json::json!({"chat_id": chat_id}))
            .and_then(|chat| {
                chat["title"]
                    .as_str()
                    .or(chat["first_name"].as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| chat_id.to_string())
    }

    fn download_attachment(&self, attachment: &Value) -> anyhow::Result<Vec<u8>> {
        let file_id = attachment["file_id"]
            .as_str()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("attachment has no file_id"))?;
        let file = self
            .api("getFile", serde_json::json!({"file_id": file_id}))
            .ok_or_else(|| anyhow::anyhow!("getFile failed"))?;
        let file_path = file["file_path"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("getFile returned no path"))?;
        let url = format!("{API_BASE}/file/bot{}/{file_path}", self.token);
        let bytes = self.client.get(&url).send()?.bytes()?;
        Ok(bytes.to_vec())
    }

    fn format_outbound(&self, by: &str, to: &[String], text: &str, is_system: bool) -> String {
        let formatted = super::format_outbound_default(by, to, text, is_system);
        self.compose_safe(&formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> TelegramAdapter {
        TelegramAdapter::new("test-token".to_string())
    }

    #[test]
    fn compose_safe_respects_hard_cap() {
        let adapter = adapter();
        let long_line = "a".repeat(10_000);
        let safe = adapter.compose_safe(&long_line);
        assert!(safe.chars().count() <= TELEGRAM_MAX_MESSAGE_LENGTH);
        assert!(safe.ends_with('…'));
    }

    #[test]
    fn normalize_extracts_text_chat_and_sender() {
        let adapter = adapter();
        let update = serde_json::json!({
            "update_id": 7,
            "message": {
                "message_id": 42,
                "text": "hello there",
                "chat": {"id": -100123, "type": "group", "title": "Team"},
                "from": {"username": "alice"},
            }
        });
        let msg = adapter.normalize_update(&update).unwrap();
        assert_eq!(msg.chat_id, "-100123");
        assert_eq!(msg.chat_type, "group");
        assert_eq!(msg.chat_title, "Team");
        assert_eq!(msg.from_user, "alice");
        assert_eq!(msg.message_id, "42");
        assert!(!msg.routed);
    }

    #[test]
    fn private_chats_are_routed() {
        let adapter = adapter();
        let update = serde_json::json!({
            "update_id": 8,
            "message": {
                "message_id": 1,
                "text": "hi",
                "chat": {"id": 555, "type": "private", "first_name": "Bob"},
                "from": {"first_name": "Bob"},
            }
        });
        let msg = adapter.normalize_update(&update).unwrap();
        assert!(msg.routed);
        assert_eq!(msg.chat_title, "Bob");
    }

    #[test]
    fn document_and_photo_become_attachments() {
        let adapter = adapter();
        let update = serde_json::json!({
            "update_id": 9,
            "message": {
                "message_id": 2,
                "caption": "see attached",
                "document": {"file_id": "F1", "file_name": "spec.pdf", "mime_type": "application/pdf", "file_size": 1234},
                "chat": {"id": 1, "type": "private"},
                "from": {"username": "alice"},
            }
        });
        let msg = adapter.normalize_update(&update).unwrap();
        assert_eq!(msg.text, "see attached");
        assert_eq!(msg.attachments.len(), 1);
        assert_eq!(msg.attachments[0]["kind"], "file");
        assert_eq!(msg.attachments[0]["file_name"], "spec.pdf");

        let photo_update = serde_json::json!({
            "update_id": 10,
            "message": {
                "message_id": 3,
                "caption": "pic",
                "photo": [
                    {"file_id": "small", "file_size": 10},
                    {"file_id": "large", "file_size": 99},
                ],
                "chat": {"id": 1, "type": "private"},
                "from": {"username": "alice"},
            }
        });
        let msg = adapter.normalize_update(&photo_update).unwrap();
        assert_eq!(msg.attachments[0]["kind"], "image");
        assert_eq!(msg.attachments[0]["file_id"], "large");
    }

    #[test]
    fn messages_without_text_are_skipped() {
        let adapter = adapter();
        let update = serde_json::json!({
            "update_id": 11,
            "message": {
                "message_id": 4,
                "chat": {"id": 1, "type": "private"},
                "from": {"username": "alice"},
            }
        });
        assert!(adapter.normalize_update(&update).is_none());
    }
}
