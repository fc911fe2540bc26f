//! Terminal transcript settings.
//!
//! Who may read another actor's terminal output, and whether idle
//! notifications include a tail snippet. The human user is always allowed;
//! these settings only govern actors. Stored leniently under the group
//! document's `terminal_transcript` key.

use serde_json::Value;

pub const VISIBILITY_VALUES: &[&str] = &["off", "foreman", "all"];

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSettings {
    /// Which actors can read other actors' transcripts.
    pub visibility: String,
    pub notify_tail: bool,
    pub notify_lines: u32,
}

impl Default for TranscriptSettings {
    fn default() -> Self {
        Self {
            visibility: "foreman".to_string(),
            notify_tail: true,
            notify_lines: 20,
        }
    }
}

fn as_visibility(value: &Value, default: &str) -> String {
    let s = value.as_str().unwrap_or("").trim().to_lowercase();
    if VISIBILITY_VALUES.contains(&s.as_str()) {
        s
    } else {
        default.to_string()
    }
}

fn as_bool(value: &Value, default: bool) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().map(|v| v != 0).unwrap_or(default),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "y" | "on" => true,
            "0" | "false" | "no" | "n" | "off" => false,
            _ => default,
        },
        _ => default,
    }
}

fn as_lines(value: &Value, default: u32) -> u32 {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .map(|n| (n as u32).clamp(1, 80))
        .unwrap_or(default)
}

/// Parse the (possibly partial or malformed) `terminal_transcript` value.
pub fn get_transcript_settings(raw: &Value) -> TranscriptSettings {
    let defaults = TranscriptSettings::default();
    let Some(map) = raw.as_object() else {
        return defaults;
    };
    TranscriptSettings {
        visibility: map
            .get("visibility")
            .map(|v| as_visibility(v, &defaults.visibility))
            .unwrap_or(defaults.visibility),
        notify_tail: map
            .get("notify_tail")
            .map(|v| as_bool(v, defaults.notify_tail))
            .unwrap_or(defaults.notify_tail),
        notify_lines: map
            .get("notify_lines")
            .map(|v| as_lines(v, defaults.notify_lines))
            .unwrap_or(defaults.notify_lines),
    }
}

/// Merge a patch into existing settings and return the normalized value to
/// store back on the group document.
pub fn apply_transcript_patch(current: &Value, patch: &Value) -> (TranscriptSettings, Value) {
    let mut merged = get_transcript_settings(current);
    if let Some(map) = patch.as_object() {
        if let Some(v) = map.get("visibility") {
            merged.visibility = as_visibility(v, &merged.visibility);
        }
        if let Some(v) = map.get("notify_tail") {
            merged.notify_tail = as_bool(v, merged.notify_tail);
        }
        if let Some(v) = map.get("notify_lines") {
            merged.notify_lines = as_lines(v, merged.notify_lines);
        }
    }
    let value = serde_json::json!({
        "visibility": merged.visibility,
        "notify_tail": merged.notify_tail,
        "notify_lines": merged.notify_lines,
    });
    (merged, value)
}
