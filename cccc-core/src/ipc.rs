//! Daemon IPC wire types and the synchronous client.
//!
//! One JSON object per line in each direction over the Unix socket. The
//! client never raises on transport trouble: socket failures become a
//! `daemon_unavailable` error response so callers handle exactly one shape.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum accepted frame size (~4 MB), both directions.
pub const MAX_FRAME_BYTES: usize = 4_000_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    #[serde(default = "default_version")]
    pub v: u32,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

fn default_version() -> u32 {
    1
}

impl DaemonRequest {
    pub fn new(op: &str, args: Value) -> Self {
        Self {
            v: 1,
            op: op.to_string(),
            args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    #[serde(default = "default_version")]
    pub v: u32,
    pub ok: bool,
    #[serde(default)]
    pub result: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

impl DaemonResponse {
    pub fn success(result: Value) -> Self {
        Self {
            v: 1,
            ok: true,
            result,
            error: None,
        }
    }

    pub fn failure(code: &str, message: &str, details: Value) -> Self {
        Self {
            v: 1,
            ok: false,
            result: Value::Object(Default::default()),
            error: Some(WireError {
                code: code.to_string(),
                message: message.to_string(),
                details,
            }),
        }
    }

    pub fn daemon_unavailable() -> Self {
        Self::failure(
            "daemon_unavailable",
            "daemon unavailable",
            Value::Object(Default::default()),
        )
    }

    pub fn error_code(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.code.as_str())
    }
}

impl From<crate::error::OpError> for DaemonResponse {
    fn from(err: crate::error::OpError) -> Self {
        Self::failure(err.code, &err.message, err.details)
    }
}

/// Send one request over the daemon socket and read one response line.
/// Any transport failure maps to `daemon_unavailable`.
pub fn call_daemon(sock_path: &Path, request: &DaemonRequest) -> DaemonResponse {
    call_daemon_with_timeout(sock_path, request, Duration::from_secs(5))
}

pub fn call_daemon_with_timeout(
    sock_path: &Path,
    request: &DaemonRequest,
    timeout: Duration,
) -> DaemonResponse {
    match call_inner(sock_path, request, timeout) {
        Ok(resp) => resp,
        Err(_) => DaemonResponse::daemon_unavailable(),
    }
}

fn call_inner(
    sock_path: &Path,
    request: &DaemonRequest,
    timeout: Duration,
) -> anyhow::Result<DaemonResponse> {
    let stream = UnixStream::connect(sock_path)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut line = serde_json::to_string(request)?;
    line.push('\n');
    (&stream).write_all(line.as_bytes())?;

    let mut reader = BufReader::new(&stream);
    let mut response = String::new();
    reader.read_line(&mut response)?;
    if response.len() > MAX_FRAME_BYTES {
        anyhow::bail!("oversized response frame");
    }
    Ok(serde_json::from_str(response.trim_end())?)
}
