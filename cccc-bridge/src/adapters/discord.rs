//! Discord adapter (REST API).
//!
//! Outbound posts to `/channels/{id}/messages` with the bot token. Inbound
//! requires a gateway websocket session, which this bridge does not carry —
//! `poll` yields nothing and the bridge runs outbound-only. Discord caps
//! messages at 2000 characters.

use std::path::Path;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;
use tracing::{debug, warn};

use super::{ImAdapter, NormalizedMessage, RateLimiter};

pub const DISCORD_MAX_MESSAGE_LENGTH: usize = 2000;
const API_BASE: &str = "https://discord.com/api/v10";

pub struct DiscordAdapter {
    token: String,
    client: Client,
    rate_limiter: RateLimiter,
}

impl DiscordAdapter {
    pub fn new(token: String) -> Self {
        Self {
            token,
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            rate_limiter: RateLimiter::new(super::platform_rate_limit("discord")),
        }
    }

    fn auth(&self) -> String {
        format!("Bot {}", self.token)
    }

    fn compose_safe(&self, text: &str) -> String {
        let summarized = self.summarize(text, 1800, 30);
        if summarized.chars().count() > DISCORD_MAX_MESSAGE_LENGTH {
            let mut out: String = summarized
                .chars()
                .take(DISCORD_MAX_MESSAGE_LENGTH - 1)
                .collect();
            out.push('…');
            out
        } else {
            summarized
        }
    }
}

impl ImAdapter for DiscordAdapter {
    fn platform(&self) -> &'static str {
        "discord"
    }

    fn connect(&self) -> bool {
        let response = self
            .client
            .get(format!("{API_BASE}/users/@me"))
            .header("Authorization", self.auth())
            .send();
        match response.and_then(|r| r.json::<Value>()) {
            Ok(me) if me["id"].is_string() => {
                debug!(bot = %me["username"], "discord bot connected");
                warn!("discord inbound needs a gateway session; running outbound-only");
                true
            }
            _ => false,
        }
    }

    fn disconnect(&self) {}

    fn poll(&self) -> Vec<NormalizedMessage> {
        // Inbound requires the gateway; nothing to poll over REST.
        Vec::new()
    }

    fn send_message(&self, chat_id: &str, text: &str, _thread_id: i64) -> bool {
        if text.is_empty() {
            return true;
        }
        let safe = self.compose_safe(text);
        self.rate_limiter.wait_and_acquire(chat_id);

        let url = format!("{API_BASE}/channels/{chat_id}/messages");
        match self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .json(&serde_json::json!({"content": safe}))
            .send()
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(err = %e, "discord message send failed");
                false
            }
        }
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
        let mut form = reqwest::blocking::multipart::Form::new().part("files[0]", part);
        if !caption.is_empty() {
            form = form.text(
                "payload_json",
                serde_json::json!({"content": self.compose_safe(caption)}).to_string(),
            );
        }

        let url = format!("{API_BASE}/channels/{chat_id}/messages");
        match self
            .client
            .post(&url)
            .header("Authorization", self.auth())
            .multipart(form)
            .send()
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(err = %e, "discord file send failed");
                false
            }
        }
    }

    fn get_chat_title(&self, chat_id: &str) -> String {
        self.client
            .get(format!("{API_BASE}/channels/{chat_id}"))
            .header("Authorization", self.auth())
            .send()
            .ok()
            .and_then(|r| r.json::<Value>().ok())
            .and_then(|c| c["name"].as_str().map(String::from))
            .unwrap_or_else(|| chat_id.to_string())
    }

    fn format_outbound(&self, by: &str, to: &[String], text: &str, is_system: bool) -> String {
        let formatted = super::format_outbound_default(by, to, text, is_system);
        self.compose_safe(&formatted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_safe_respects_discord_cap() {
        let adapter = DiscordAdapter::new("token".to_string());
        let long_line = "a".repeat(5000);
        let safe = adapter.compose_safe(&long_line);
        assert!(safe.chars().count() <= DISCORD_MAX_MESSAGE_LENGTH);
        assert!(safe.ends_with('…'));
    }

    #[test]
    fn agent_to_agent_format_survives_the_cap() {
        let adapter = DiscordAdapter::new("token".to_string());
        let out = adapter.format_outbound(
            "peer-a",
            &["lead".to_string()],
            "short message",
            false,
        );
        assert_eq!(out, "[peer-a → lead] short message");
    }
}
