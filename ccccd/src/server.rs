//! The ccccd IPC server.
//!
//! One Unix stream socket, one JSON object per line in each direction. The
//! accept loop hands each connection to its own task; mutating ops serialize
//! behind the daemon-wide op lock. `term_attach` is special: after the JSON
//! ack the connection becomes a raw byte channel owned by the PTY session.
//!
//! Startup: refuse to double-start against a live socket, reap orphaned
//! actor processes from a previous crash, then autostart every group whose
//! desired run-state is `running`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use cccc_core::fsutil::atomic_write_text;
use cccc_core::ipc::{DaemonRequest, DaemonResponse, MAX_FRAME_BYTES, call_daemon_with_timeout};
use cccc_core::paths;

use crate::automation::AutomationManager;
use crate::delivery::DeliveryManager;
use crate::headless::HeadlessSupervisor;
use crate::ops;
use crate::pty::PtySupervisor;
use crate::runner_state;

const AUTOMATION_TICK: Duration = Duration::from_secs(1);
const COMPACTION_TICK: Duration = Duration::from_secs(60);

/// Everything op handlers need, owned for the process lifetime.
pub struct Daemon {
    pub home: PathBuf,
    pub supervisor: Arc<PtySupervisor>,
    pub headless: Arc<HeadlessSupervisor>,
    pub delivery: Arc<DeliveryManager>,
    pub automation: Arc<AutomationManager>,
    /// Serializes mutating ops: a single writer per daemon.
    pub op_lock: Mutex<()>,
}

impl Daemon {
    /// True when any runner (pty or headless) is alive for the group.
    pub fn group_running(&self, group_id: &str) -> bool {
        self.supervisor.group_running(group_id) || self.headless.group_running(group_id)
    }
}

fn socket_alive(sock_path: &std::path::Path) -> bool {
    let resp = call_daemon_with_timeout(
        sock_path,
        &DaemonRequest::new("ping", serde_json::Value::Null),
        Duration::from_millis(300),
    );
    resp.ok
}

/// Run the daemon until a `shutdown` op arrives. Returns the process exit
/// code (0 also when another daemon is already serving).
pub async fn serve(home: PathBuf) -> anyhow::Result<i32> {
    let daemon_dir = paths::daemon_dir(&home);
    std::fs::create_dir_all(&daemon_dir)
        .with_context(|| format!("failed to create {}", daemon_dir.display()))?;
    let sock_path = paths::socket_path(&home);

    if sock_path.exists() {
        if socket_alive(&sock_path) {
            info!("another daemon is already serving, exiting");
            return Ok(0);
        }
        let _ = std::fs::remove_file(&sock_path);
    }

    // Reap actor processes orphaned by a previous daemon crash.
    {
        let home = home.clone();
        tokio::task::spawn_blocking(move || runner_state::cleanup_stale_pty_state(&home))
            .await
            .ok();
    }

    let daemon = Arc::new(Daemon {
        home: home.clone(),
        supervisor: Arc::new(PtySupervisor::new()),
        headless: Arc::new(HeadlessSupervisor::new()),
        delivery: Arc::new(DeliveryManager::new()),
        automation: Arc::new(AutomationManager::new()),
        op_lock: Mutex::new(()),
    });

    // Clean exits delete the runner sidecar (only while it still names the
    // exited pid).
    {
        let hook_home = home.clone();
        daemon.supervisor.set_exit_hook(Box::new(move |gid, aid, pid| {
            runner_state::remove_pty_state_if_pid(&hook_home, gid, aid, pid);
        }));
    }

    autostart_running_groups(&daemon).await;

    let listener = UnixListener::bind(&sock_path)
        .with_context(|| format!("failed to bind {}", sock_path.display()))?;
    atomic_write_text(
        &paths::pid_path(&home),
        &format!("{}\n", std::process::id()),
    )?;
    info!(socket = %sock_path.display(), pid = std::process::id(), "ccccd listening");

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Automation ticker (1 s) with a piggybacked compaction pass (60 s).
    let ticker_daemon = daemon.clone();
    let mut ticker_shutdown = shutdown_rx.clone();
    let ticker = tokio::spawn(async move {
        let mut next_compaction = tokio::time::Instant::now() + COMPACTION_TICK;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(AUTOMATION_TICK) => {
                    ticker_daemon
                        .automation
                        .tick(&ticker_daemon.home, &ticker_daemon.supervisor, &ticker_daemon.delivery)
                        .await;
                    if tokio::time::Instant::now() >= next_compaction {
                        next_compaction = tokio::time::Instant::now() + COMPACTION_TICK;
                        compact_running_groups(&ticker_daemon).await;
                    }
                }
                _ = ticker_shutdown.changed() => {
                    if *ticker_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, _addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(err = %e, "accept failed");
                        continue;
                    }
                };
                let daemon = daemon.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    handle_connection(daemon, stream, shutdown_tx).await;
                });
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    info!("shutting down");
    daemon.supervisor.stop_all().await;
    daemon.headless.stop_all();
    ticker.abort();
    let _ = std::fs::remove_file(&sock_path);
    Ok(0)
}

async fn handle_connection(
    daemon: Arc<Daemon>,
    stream: UnixStream,
    shutdown_tx: watch::Sender<bool>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    let read = reader.read_line(&mut line).await;
    if read.is_err() || line.trim().is_empty() || line.len() > MAX_FRAME_BYTES {
        let resp = DaemonResponse::failure(
            "invalid_request",
            "invalid request",
            serde_json::Value::Null,
        );
        let _ = write_response(reader.get_mut(), &resp).await;
        return;
    }

    let request: DaemonRequest = match serde_json::from_str(line.trim_end()) {
        Ok(req) => req,
        Err(e) => {
            let resp = DaemonResponse::failure(
                "invalid_request",
                "invalid request",
                serde_json::json!({"error": e.to_string()}),
            );
            let _ = write_response(reader.get_mut(), &resp).await;
            return;
        }
    };

    if request.op.trim() == "term_attach" {
        handle_term_attach(&daemon, reader, &request).await;
        return;
    }
    if request.op.trim() == "events_stream" {
        handle_events_stream(&daemon, reader, &request).await;
        return;
    }

    let (response, should_exit) = ops::dispatch(&daemon, request).await;
    let _ = write_response(reader.get_mut(), &response).await;
    if should_exit {
        let _ = shutdown_tx.send(true);
    }
}

/// Promote the connection to a raw terminal channel attached to an actor's
/// pty. After the ack the server stops parsing JSON on this connection.
async fn handle_term_attach(daemon: &Daemon, reader: BufReader<UnixStream>, request: &DaemonRequest) {
    let args = &request.args;
    let group_id = args
        .get("group_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let actor_id = args
        .get("actor_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    let response = if group_id.is_empty() {
        DaemonResponse::failure("missing_group_id", "missing group_id", serde_json::Value::Null)
    } else if actor_id.is_empty() {
        DaemonResponse::failure("missing_actor_id", "missing actor_id", serde_json::Value::Null)
    } else if !daemon.supervisor.actor_running(&group_id, &actor_id) {
        DaemonResponse::failure(
            "actor_not_running",
            "actor is not running",
            serde_json::Value::Null,
        )
    } else {
        DaemonResponse::success(serde_json::json!({"group_id": group_id, "actor_id": actor_id}))
    };

    // Bytes the client pipelined behind the request line belong to the raw
    // channel; hand them to the session as pending input.
    let pending = reader.buffer().to_vec();
    let mut stream = reader.into_inner();
    if write_response(&mut stream, &response).await.is_err() {
        return;
    }
    if !response.ok {
        return;
    }
    if let Err(e) = daemon.supervisor.attach(&group_id, &actor_id, stream, pending) {
        debug!(err = %e, "term_attach lost the session before attach");
    }
}

/// Promote the connection to a one-way NDJSON event feed for one group.
async fn handle_events_stream(
    daemon: &Daemon,
    reader: BufReader<UnixStream>,
    request: &DaemonRequest,
) {
    let args = &request.args;
    let group_id = args
        .get("group_id")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    let by = args
        .get("by")
        .and_then(|v| v.as_str())
        .unwrap_or("user")
        .trim()
        .to_string();
    let kinds: Vec<String> = args
        .get("kinds")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    let group = if group_id.is_empty() {
        None
    } else {
        cccc_core::group::load_group(&daemon.home, &group_id)
    };
    let response = if group_id.is_empty() {
        DaemonResponse::failure("missing_group_id", "missing group_id", serde_json::Value::Null)
    } else if group.is_none() {
        DaemonResponse::failure(
            "group_not_found",
            &format!("group not found: {group_id}"),
            serde_json::Value::Null,
        )
    } else {
        DaemonResponse::success(serde_json::json!({
            "group_id": group_id,
            "kinds": crate::streaming::STREAMABLE_KINDS,
        }))
    };

    let mut stream = reader.into_inner();
    if write_response(&mut stream, &response).await.is_err() || !response.ok {
        return;
    }
    if let Some(group) = group {
        crate::streaming::stream_events(group, by, kinds, stream).await;
    }
}

async fn write_response(stream: &mut UnixStream, response: &DaemonResponse) -> std::io::Result<()> {
    let mut out = serde_json::to_string(response).unwrap_or_else(|_| {
        "{\"v\":1,\"ok\":false,\"error\":{\"code\":\"invalid_request\",\"message\":\"serialization failed\",\"details\":{}}}".to_string()
    });
    out.push('\n');
    stream.write_all(out.as_bytes()).await?;
    stream.flush().await
}

/// Restore groups whose desired run-state is `running`. A group without an
/// active scope cannot run; its flag is cleared instead.
async fn autostart_running_groups(daemon: &Daemon) {
    let Ok(entries) = std::fs::read_dir(paths::groups_dir(&daemon.home)) else {
        return;
    };
    for entry in entries.flatten() {
        let gid = entry.file_name().to_string_lossy().to_string();
        let Some(mut group) = cccc_core::group::load_group(&daemon.home, &gid) else {
            continue;
        };
        if !group.doc.running {
            continue;
        }
        if group.doc.active_scope_key.trim().is_empty() {
            group.doc.running = false;
            let _ = group.save();
            continue;
        }
        match ops::spawn_enabled_actors(daemon, &group).await {
            Ok((started, _)) => {
                info!(group_id = %gid, started = started.len(), "autostarted running group");
            }
            Err(e) => {
                warn!(group_id = %gid, err = %e, "autostart failed");
            }
        }
    }
}

async fn compact_running_groups(daemon: &Daemon) {
    let Ok(entries) = std::fs::read_dir(paths::groups_dir(&daemon.home)) else {
        return;
    };
    for entry in entries.flatten() {
        let gid = entry.file_name().to_string_lossy().to_string();
        let Some(group) = cccc_core::group::load_group(&daemon.home, &gid) else {
            continue;
        };
        if !group.doc.running {
            continue;
        }
        if let Err(e) = cccc_core::retention::compact(&group, "auto", false) {
            debug!(group_id = %gid, err = %e, "auto compaction failed");
        }
    }
}
