//! IM command parsing and response formatting.
//!
//! Commands are `/`-prefixed and case-insensitive; the grammar tolerates the
//! `@BotName` suffix platforms append in group-privacy mode, both before and
//! after the command token. `@mentions` in the body become recipient tokens.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Subscribe,
    Unsubscribe,
    Verbose,
    Status,
    Context,
    Pause,
    Resume,
    Launch,
    Quit,
    Help,
    Send,
    /// Not a command: plain chat content.
    Message,
}

#[derive(Debug, Clone)]
pub struct ParsedCommand {
    pub command: CommandType,
    /// Remaining text after the command token (or the full text for
    /// `Message`).
    pub text: String,
    /// Mention tokens, ready for recipient resolution (`@all`, actor ids).
    pub mentions: Vec<String>,
}

fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)^(?:@\S+\s+)?/(\w+)(?:@\S+)?(?:\s+(.*))?$").expect("command regex")
    })
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?:^|\s)@([a-zA-Z][a-zA-Z0-9_-]*)").expect("mention regex"))
}

fn map_command(name: &str) -> CommandType {
    match name {
        "subscribe" | "sub" => CommandType::Subscribe,
        "unsubscribe" | "unsub" => CommandType::Unsubscribe,
        "verbose" | "v" => CommandType::Verbose,
        "status" | "s" => CommandType::Status,
        "context" | "ctx" => CommandType::Context,
        "pause" => CommandType::Pause,
        "resume" => CommandType::Resume,
        "launch" | "start" => CommandType::Launch,
        "quit" | "stop" => CommandType::Quit,
        "help" | "h" => CommandType::Help,
        "send" => CommandType::Send,
        _ => CommandType::Message,
    }
}

/// Extract `@mention` tokens: selectors keep their `@`, actor ids are
/// lowercased, bot-style names (`…bot`) are dropped.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for capture in mention_re().captures_iter(text) {
        let Some(word) = capture.get(1) else { continue };
        let word = word.as_str();
        if word.to_lowercase().ends_with("bot") {
            continue;
        }
        let lower = word.to_lowercase();
        let token = match lower.as_str() {
            "all" | "peers" | "foreman" | "user" => format!("@{lower}"),
            _ => lower,
        };
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

/// Parse one IM message into a command or plain content.
pub fn parse_message(text: &str) -> ParsedCommand {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParsedCommand {
            command: CommandType::Message,
            text: String::new(),
            mentions: Vec::new(),
        };
    }
    let mentions = extract_mentions(trimmed);

    if let Some(caps) = command_re().captures(trimmed) {
        let name = caps
            .get(1)
            .map(|m| m.as_str().to_lowercase())
            .unwrap_or_default();
        let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
        let command = map_command(&name);
        if command != CommandType::Message {
            return ParsedCommand {
                command,
                text: rest.to_string(),
                mentions,
            };
        }
    }
    ParsedCommand {
        command: CommandType::Message,
        text: trimmed.to_string(),
        mentions,
    }
}

pub fn format_help(platform: &str) -> String {
    let talk_tip = match platform {
        "slack" | "discord" => "mention the bot (e.g. @bot hello) to talk to agents",
        _ => "use /send <message> to talk to agents in groups",
    };
    format!(
        "CCCC commands:\n\
         \n\
         Messages:\n\
         /send <message> — send to the group (add @actor, @all, @foreman)\n\
         ({talk_tip})\n\
         \n\
         Subscription:\n\
         /subscribe — receive group messages here\n\
         /unsubscribe — stop receiving\n\
         /verbose — toggle agent-to-agent traffic\n\
         \n\
         Status:\n\
         /status — group and actor status\n\
         /context — project context documents\n\
         \n\
         Control:\n\
         /pause — pause delivery\n\
         /resume — resume delivery\n\
         /launch — start all agents\n\
         /quit — stop all agents\n\
         \n\
         /help — this text"
    )
}

pub fn format_status(group_title: &str, state: &str, running: bool, actors: &[Value]) -> String {
    let mut lines = vec![
        format!("📊 {group_title}"),
        format!(
            "State: {state} | Running: {}",
            if running { "✓" } else { "✗" }
        ),
        String::new(),
    ];
    if actors.is_empty() {
        lines.push("No actors configured".to_string());
    } else {
        lines.push("Actors:".to_string());
        for actor in actors {
            let id = actor["id"].as_str().unwrap_or("?");
            let role = actor["role"].as_str().unwrap_or("peer");
            let enabled = actor["enabled"].as_bool().unwrap_or(true);
            let marker = if enabled { "●" } else { "○" };
            lines.push(format!("  {marker} {id} ({role})"));
        }
    }
    lines.join("\n")
}

pub fn format_context(context: &Value) -> String {
    let Some(docs) = context.as_object().filter(|m| !m.is_empty()) else {
        return "ℹ️ No context documents yet.".to_string();
    };
    let mut out = String::new();
    for (name, body) in docs {
        let text = body.as_str().unwrap_or("");
        out.push_str(&format!("── {name} ──\n{}\n", text.trim()));
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slash_commands_parse_case_insensitively() {
        assert_eq!(parse_message("/subscribe").command, CommandType::Subscribe);
        assert_eq!(parse_message("/SUB").command, CommandType::Subscribe);
        assert_eq!(parse_message("/Status").command, CommandType::Status);
        assert_eq!(parse_message("/quit").command, CommandType::Quit);
        assert_eq!(parse_message("/stop").command, CommandType::Quit);
    }

    #[test]
    fn botname_suffix_and_prefix_are_tolerated() {
        assert_eq!(parse_message("/status@MyBot").command, CommandType::Status);
        assert_eq!(
            parse_message("@MyBot /pause").command,
            CommandType::Pause
        );
    }

    #[test]
    fn send_keeps_its_payload() {
        let parsed = parse_message("/send @peer-a please review the diff");
        assert_eq!(parsed.command, CommandType::Send);
        assert_eq!(parsed.text, "@peer-a please review the diff");
        assert_eq!(parsed.mentions, vec!["peer-a"]);
    }

    #[test]
    fn unknown_slash_commands_are_plain_messages() {
        let parsed = parse_message("/frobnicate now");
        assert_eq!(parsed.command, CommandType::Message);
        assert_eq!(parsed.text, "/frobnicate now");
    }

    #[test]
    fn mentions_keep_selectors_and_drop_bots() {
        let mentions = extract_mentions("@peer-a check with @ALL but not @HelperBot");
        assert_eq!(mentions, vec!["peer-a", "@all"]);
        // Email-like strings are not mentions.
        assert!(extract_mentions("mail me at a@b.com").is_empty());
    }

    #[test]
    fn plain_message_round_trips() {
        let parsed = parse_message("  hello world  ");
        assert_eq!(parsed.command, CommandType::Message);
        assert_eq!(parsed.text, "hello world");
        assert!(parsed.mentions.is_empty());
    }

    #[test]
    fn status_format_lists_actors() {
        let actors = vec![
            serde_json::json!({"id": "lead", "role": "foreman", "enabled": true}),
            serde_json::json!({"id": "peer-a", "role": "peer", "enabled": false}),
        ];
        let out = format_status("build", "active", true, &actors);
        assert!(out.contains("● lead (foreman)"));
        assert!(out.contains("○ peer-a (peer)"));
    }
}
