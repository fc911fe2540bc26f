//! Slack adapter (Web API).
//!
//! Outbound goes through `chat.postMessage` with the bot token. Inbound
//! requires a Socket Mode app token and the event stream SDK, which this
//! bridge does not carry — without it `poll` yields nothing and the bridge
//! runs outbound-only (subscribe/commands then happen from another surface).
//! Slack caps messages at 4000 characters.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ImAdapter, NormalizedMessage, RateLimiter};

pub const SLACK_MAX_MESSAGE_LENGTH: usize = 4000;
const API_BASE: &str = "https://slack.com/api";

pub struct SlackAdapter {
    bot_token: String,
    client: Client,
    rate_limiter: RateLimiter,
    summarize_chars: usize,
    summarize_lines: usize,
}

impl SlackAdapter {
    pub fn new(bot_token: String) -> Self {
        Self {
            bot_token,
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            rate_limiter: RateLimiter::new(super::platform_rate_limit("slack")),
            summarize_chars: 3500,
            summarize_lines: 40,
        }
    }

    fn api(&self, method: &str, params: Value) -> Option<Value> {
        let url = format!("{API_BASE}/{method}");
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.bot_token)
            .json(&params)
            .send()
            .ok()?;
        let body: Value = response.json().ok()?;
        if body["ok"].as_bool() != Some(true) {
            debug!(method, error = %body["error"], "slack api returned ok=false");
            return None;
        }
        Some(body)
    }

    fn compose_safe(&self, text: &str) -> String {
        let summarized = self.summarize(text, self.summarize_chars, self.summarize_lines);
        if summarized.chars().count() > SLACK_MAX_MESSAGE_LENGTH {
            let mut out: String = summarized
                .chars()
                .take(SLACK_MAX_MESSAGE_LENGTH - 1)
                .collect();
            out.push('…');
            out
        } else {
            summarized
        }
    }
}

impl ImAdapter for SlackAdapter {
    fn platform(&self) -> &'static str {
        "slack"
    }

    fn connect(&self) -> bool {
        match self.api("auth.test", serde_json::json!({})) {
            Some(me) => {
                debug!(bot = %me["user"], team = %me["team"], "slack bot connected");
                warn!("slack inbound needs a Socket Mode app token; running outbound-only");
                true
            }
            None => false,
        }
    }

    fn disconnect(&self) {}

    fn poll(&self) -> Vec<NormalizedMessage> {
        // Inbound requires Socket Mode; nothing to poll over the Web API.
        Vec::new()
    }

    fn send_message(&self, chat_id: &str, text: &str, thread_id: i64) -> bool {
        if text.is_empty() {
            return true;
        }
        let safe = self.compose_safe(text);
        self.rate_limiter.wait_and_acquire(chat_id);

        let mut params = serde_json::json!({
            "channel": chat_id,
            "text": safe,
        });
        if thread_id > 0 {
            // Slack threads key on the parent message timestamp.
            params["thread_ts"] = Value::String(thread_id.to_string());
        }
        self.api("chat.postMessage", params).is_some()
    }

    fn send_file(
        &self,
        chat_id: &str,
        file_path: &Path,
        filename: &str,
        caption: &str,
        _thread_id: i64,
    ) -> bool {
        let Ok(bytes) = std::fs::read(file_path) else {
            return false;
        };
        self.rate_limiter.wait_and_acquire(chat_id);

        let part =
            reqwest::blocking::multipart::Part::bytes(bytes).file_name(filename.to_string());
        let mut form = reqwest::blocking::multipart::Form::new()
            .text("channels", chat_id.to_string())
            .part("file", part);
        if !caption.is_empty() {
            form = form.text("initial_comment", self.summarize(caption, 1000, 8));
        }

        let url = format!("{API_BASE}/files.upload");
        match self
            .client
            .post(&url)
            .bearer_auth(&self.bot_token)
            .multipart(form)
            .send()
        {
            Ok(response) => response
                .json::<Value>()
                .ok()
                .and_then(|v| v["ok"].as_bool())
                .unwrap_or(false),
            Err(e) => {
                warn!(err = %e, "slack files.upload failed");
                false
            }
        }
    }

    fn get_chat_title(&self, chat_id: &str) -> String {
        self.api(
            "conversations.info",
            serde_json::json!({"channel": chat_id}),
        )
        .and_then(|body| body["channel"]["name"].as_str().map(String::from))
        .unwrap_or_else(|| chat_id.to_string())
    }

    fn format_outbound(&self, by: &str, to: &[String], text: &str, is_system: bool) -> String {
        let formatted = super::format_outbound_default(by, to, text, is_system);
        self.compose_safe(&formatted)
    }
}
