//! Typed operation errors with stable wire codes.
//!
//! Every daemon op resolves to either a result payload or an `OpError`; the
//! dispatch layer serializes the error as `{code, message, details}` and the
//! code strings are a compatibility surface for clients.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct OpError {
    pub code: &'static str,
    pub message: String,
    pub details: Value,
}

impl OpError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Value::Object(Default::default()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn missing_group_id() -> Self {
        Self::new("missing_group_id", "missing group_id")
    }

    pub fn missing_actor_id() -> Self {
        Self::new("missing_actor_id", "missing actor_id")
    }

    pub fn missing_event_id() -> Self {
        Self::new("missing_event_id", "missing event_id")
    }

    pub fn group_not_found(group_id: &str) -> Self {
        Self::new("group_not_found", format!("group not found: {group_id}"))
    }

    pub fn actor_not_found(actor_id: &str) -> Self {
        Self::new("actor_not_found", format!("actor not found: {actor_id}"))
    }

    pub fn event_not_found(event_id: &str) -> Self {
        Self::new("event_not_found", format!("event not found: {event_id}"))
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new("permission_denied", message)
    }

    pub fn scope_not_attached(scope_key: &str) -> Self {
        Self::new(
            "scope_not_attached",
            format!("scope not attached: {scope_key}"),
        )
        .with_details(serde_json::json!({
            "hint": "attach scope first (cccc attach <path> --group <id>)",
        }))
    }

    pub fn invalid_project_root(path: &str) -> Self {
        Self::new("invalid_project_root", "project root path does not exist").with_details(
            serde_json::json!({
                "path": path,
                "hint": "re-attach a valid project root (cccc attach <path> --group <id>)",
            }),
        )
    }
}

pub type OpResult<T> = Result<T, OpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_strings() {
        assert_eq!(OpError::missing_group_id().code, "missing_group_id");
        assert_eq!(OpError::group_not_found("g_1").code, "group_not_found");
        assert_eq!(
            OpError::scope_not_attached("s_x").message,
            "scope not attached: s_x"
        );
    }

    #[test]
    fn details_carry_hints() {
        let err = OpError::invalid_project_root("/does/not/exist");
        assert_eq!(err.details["path"], "/does/not/exist");
    }
}
