//! PTY actor supervisor.
//!
//! Each actor session owns one pty pair and one child process. A blocking
//! reader thread drains the master in 64 KiB chunks, feeding both a bounded
//! in-memory backlog ring (for attach replay) and a broadcast channel that
//! fans out to every attached terminal client. Stdin writes funnel through a
//! writer channel applied on a blocking thread.
//!
//! Fan-out policy: a client that cannot keep up lags on the broadcast
//! channel and is detached — the session loop is never throttled by a slow
//! client, and healthy clients observe bytes in read order.
//!
//! At most one attached client is the writer; when it detaches, the next
//! attached client is promoted.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const READ_CHUNK_BYTES: usize = 65536;
const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 40;
const DEFAULT_MAX_BACKLOG_BYTES: usize = 2_000_000;
/// 128 pending 64 KiB chunks ≈ the 8 MB per-client cap before a drop.
const CLIENT_CHANNEL_CHUNKS: usize = 128;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const BRACKETED_PASTE_ENABLE: &[u8] = b"\x1b[?2004h";
const BRACKETED_PASTE_DISABLE: &[u8] = b"\x1b[?2004l";

/// Whether this build can host pty runners at all.
pub fn pty_supported() -> bool {
    cfg!(any(unix, windows))
}

struct StreamState {
    backlog: VecDeque<Vec<u8>>,
    backlog_bytes: usize,
    max_backlog_bytes: usize,
    mode_tail: Vec<u8>,
    bracketed_paste: bool,
}

impl StreamState {
    fn new(max_backlog_bytes: usize) -> Self {
        Self {
            backlog: VecDeque::new(),
            backlog_bytes: 0,
            max_backlog_bytes,
            mode_tail: Vec::new(),
            bracketed_paste: false,
        }
    }

    fn append(&mut self, chunk: &[u8]) {
        self.update_input_modes(chunk);
        self.backlog.push_back(chunk.to_vec());
        self.backlog_bytes += chunk.len();
        while self.max_backlog_bytes > 0
            && self.backlog_bytes > self.max_backlog_bytes
            && self.backlog.len() > 1
        {
            if let Some(dropped) = self.backlog.pop_front() {
                self.backlog_bytes -= dropped.len();
            }
        }
    }

    /// Track the most recent bracketed-paste enable/disable sequence. A small
    /// tail carries over between reads so sequences split across chunk
    /// boundaries are still seen.
    fn update_input_modes(&mut self, chunk: &[u8]) {
        let mut data = std::mem::take(&mut self.mode_tail);
        data.extend_from_slice(chunk);
        let last_enable = rfind(&data, BRACKETED_PASTE_ENABLE);
        let last_disable = rfind(&data, BRACKETED_PASTE_DISABLE);
        if last_enable.is_some() || last_disable.is_some() {
            self.bracketed_paste = last_enable > last_disable;
        }
        let keep = BRACKETED_PASTE_ENABLE.len().max(BRACKETED_PASTE_DISABLE.len()) - 1;
        let start = data.len().saturating_sub(keep);
        self.mode_tail = data[start..].to_vec();
    }

    fn snapshot(&self, max_bytes: usize) -> Vec<u8> {
        let limit = if max_bytes == 0 {
            self.max_backlog_bytes.max(DEFAULT_MAX_BACKLOG_BYTES)
        } else {
            max_bytes
        };
        let mut out: Vec<u8> = Vec::new();
        let mut total = 0usize;
        let mut chunks: Vec<&Vec<u8>> = Vec::new();
        for chunk in self.backlog.iter().rev() {
            chunks.push(chunk);
            total += chunk.len();
            if total >= limit {
                break;
            }
        }
        for chunk in chunks.into_iter().rev() {
            out.extend_from_slice(chunk);
        }
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        out
    }
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).rev().find(|&i| &haystack[i..i + needle.len()] == needle)
}

struct ClientRegistry {
    next_id: u64,
    writer: Option<u64>,
    attached: std::collections::BTreeSet<u64>,
}

pub struct PtySession {
    pub group_id: String,
    pub actor_id: String,
    pid: u32,
    running: AtomicBool,
    exited: AtomicBool,
    stream: StdMutex<StreamState>,
    output_tx: broadcast::Sender<Vec<u8>>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    clients: StdMutex<ClientRegistry>,
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,
    shutdown_tx: watch::Sender<bool>,
}

impl PtySession {
    fn spawn(
        group_id: &str,
        actor_id: &str,
        cwd: &Path,
        command: &[String],
        env: &HashMap<String, String>,
        max_backlog_bytes: usize,
    ) -> anyhow::Result<(Arc<Self>, oneshot::Receiver<i32>)> {
        let pty_system = native_pty_system();
        let pair = pty_system.openpty(PtySize {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let cmd: Vec<&String> = command.iter().filter(|c| !c.trim().is_empty()).collect();
        let mut builder = if cmd.is_empty() {
            CommandBuilder::new(if Path::new("/bin/bash").exists() { "bash" } else { "sh" })
        } else {
            let mut b = CommandBuilder::new(cmd[0]);
            for arg in &cmd[1..] {
                b.arg(arg);
            }
            b
        };
        builder.cwd(cwd);
        for (key, value) in env {
            builder.env(key, value);
        }
        if env.get("TERM").is_none() && std::env::var_os("TERM").is_none() {
            builder.env("TERM", "xterm-256color");
        }

        let mut child = pair.slave.spawn_command(builder)?;
        drop(pair.slave);
        let killer = child.clone_killer();
        let pid = child.process_id().unwrap_or(0);

        let (output_tx, _) = broadcast::channel::<Vec<u8>>(CLIENT_CHANNEL_CHUNKS);
        let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(CLIENT_CHANNEL_CHUNKS);
        let (shutdown_tx, _) = watch::channel(false);

        let session = Arc::new(Self {
            group_id: group_id.to_string(),
            actor_id: actor_id.to_string(),
            pid,
            running: AtomicBool::new(true),
            exited: AtomicBool::new(false),
            stream: StdMutex::new(StreamState::new(max_backlog_bytes)),
            output_tx: output_tx.clone(),
            writer_tx,
            clients: StdMutex::new(ClientRegistry {
                next_id: 1,
                writer: None,
                attached: Default::default(),
            }),
            master: StdMutex::new(Some(pair.master)),
            killer: StdMutex::new(killer),
            shutdown_tx,
        });

        // Reader: blocking thread draining the master into backlog + fan-out.
        let mut reader = {
            let guard = session.master.lock().expect("master lock");
            guard.as_ref().expect("master present at spawn").try_clone_reader()?
        };
        let reader_session = session.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = &buf[..n];
                        if let Ok(mut stream) = reader_session.stream.lock() {
                            stream.append(chunk);
                        }
                        let _ = reader_session.output_tx.send(chunk.to_vec());
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        // Writer: apply stdin writes on a blocking thread, preserving order.
        let writer = {
            let guard = session.master.lock().expect("master lock");
            guard.as_ref().expect("master present at spawn").take_writer()?
        };
        let writer = Arc::new(StdMutex::new(writer));
        tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                let writer = writer.clone();
                let _ = tokio::task::spawn_blocking(move || {
                    if let Ok(mut guard) = writer.lock() {
                        use std::io::Write;
                        let _ = guard.write_all(&bytes);
                        let _ = guard.flush();
                    }
                })
                .await;
            }
        });

        // Wait for exit on a blocking thread, then resolve the exit channel.
        let (exit_tx, exit_rx) = oneshot::channel::<i32>();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(_) => -1,
            };
            let _ = exit_tx.send(code);
        });

        Ok((session, exit_rx))
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.exited.load(Ordering::SeqCst)
    }

    pub fn bracketed_paste_enabled(&self) -> bool {
        self.stream
            .lock()
            .map(|s| s.bracketed_paste)
            .unwrap_or(false)
    }

    /// Latest output bytes, bounded. For transcript tails and diagnostics.
    pub fn tail_output(&self, max_bytes: usize) -> Vec<u8> {
        self.stream
            .lock()
            .map(|s| s.snapshot(max_bytes))
            .unwrap_or_default()
    }

    pub fn clear_backlog(&self) {
        if let Ok(mut stream) = self.stream.lock() {
            stream.backlog.clear();
            stream.backlog_bytes = 0;
            stream.mode_tail.clear();
        }
    }

    pub fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            return;
        }
        if let Ok(guard) = self.master.lock() {
            if let Some(master) = guard.as_ref() {
                let _ = master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                });
            }
        }
        best_effort_killpg(self.pid, libc::SIGWINCH);
    }

    /// Write input bytes to the pty, waiting up to ~5 s for channel space.
    pub async fn write_input(&self, data: Vec<u8>) -> bool {
        if data.is_empty() {
            return true;
        }
        if !self.is_running() {
            return false;
        }
        tokio::time::timeout(WRITE_TIMEOUT, self.writer_tx.send(data))
            .await
            .map(|sent| sent.is_ok())
            .unwrap_or(false)
    }

    /// SIGTERM the process group, wait up to 1 s, escalate to SIGKILL.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        best_effort_killpg(self.pid, libc::SIGTERM);
        for _ in 0..20 {
            if self.exited.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !self.exited.load(Ordering::SeqCst) {
            if let Ok(mut killer) = self.killer.lock() {
                let _ = killer.kill();
            }
        }
        let _ = self.shutdown_tx.send(true);
        // Drop the master so the pty fds close.
        if let Ok(mut guard) = self.master.lock() {
            guard.take();
        }
    }

    fn mark_exited(&self) {
        self.exited.store(true, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(true);
    }

    fn is_writer(&self, client_id: u64) -> bool {
        self.clients
            .lock()
            .map(|c| c.writer == Some(client_id))
            .unwrap_or(false)
    }

    fn register_client(&self) -> (u64, bool) {
        let mut clients = self.clients.lock().expect("client registry lock");
        let id = clients.next_id;
        clients.next_id += 1;
        clients.attached.insert(id);
        let writer = if clients.writer.is_none() {
            clients.writer = Some(id);
            true
        } else {
            false
        };
        (id, writer)
    }

    fn detach_client(&self, client_id: u64) {
        let mut clients = self.clients.lock().expect("client registry lock");
        clients.attached.remove(&client_id);
        if clients.writer == Some(client_id) {
            // Promote the longest-attached remaining client.
            clients.writer = clients.attached.iter().next().copied();
        }
    }

    /// Attach a raw terminal client. The stream first receives the current
    /// backlog, then live output; client input is forwarded to the pty only
    /// while this client holds the writer role.
    pub fn attach(self: &Arc<Self>, stream: UnixStream, pending_input: Vec<u8>) {
        let (client_id, is_writer) = self.register_client();
        let backlog = self
            .stream
            .lock()
            .map(|s| s.snapshot(0))
            .unwrap_or_default();
        let mut output_rx = self.output_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let session = self.clone();

        debug!(
            group_id = %self.group_id,
            actor_id = %self.actor_id,
            client_id,
            is_writer,
            "terminal client attached"
        );

        tokio::spawn(async move {
            let (mut read_half, mut write_half) = stream.into_split();

            if !backlog.is_empty() && write_half.write_all(&backlog).await.is_err() {
                session.detach_client(client_id);
                return;
            }
            if !pending_input.is_empty() && session.is_writer(client_id) {
                let _ = session.writer_tx.send(pending_input).await;
            }

            let mut buf = [0u8; READ_CHUNK_BYTES];
            loop {
                tokio::select! {
                    read = read_half.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if session.is_writer(client_id)
                                && session.writer_tx.send(buf[..n].to_vec()).await.is_err()
                            {
                                break;
                            }
                            // Non-writer input is discarded.
                        }
                    },
                    out = output_rx.recv() => match out {
                        Ok(chunk) => {
                            if write_half.write_all(&chunk).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Slow consumer: drop the client, never the data.
                            warn!(client_id, skipped, "terminal client lagging, detaching");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            session.detach_client(client_id);
            debug!(client_id, "terminal client detached");
        });
    }
}

fn best_effort_killpg(pid: u32, sig: i32) {
    if pid == 0 {
        return;
    }
    unsafe {
        if libc::killpg(pid as i32, sig) != 0 {
            let _ = libc::kill(pid as i32, sig);
        }
    }
}

type ExitHook = Box<dyn Fn(&str, &str, u32) + Send + Sync>;

/// Owns every live session, keyed by (group_id, actor_id).
pub struct PtySupervisor {
    sessions: StdMutex<HashMap<(String, String), Arc<PtySession>>>,
    exit_hook: StdMutex<Option<ExitHook>>,
}

impl Default for PtySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl PtySupervisor {
    pub fn new() -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            exit_hook: StdMutex::new(None),
        }
    }

    pub fn set_exit_hook(&self, hook: ExitHook) {
        *self.exit_hook.lock().expect("exit hook lock") = Some(hook);
    }

    fn session(&self, group_id: &str, actor_id: &str) -> Option<Arc<PtySession>> {
        let key = (group_id.trim().to_string(), actor_id.trim().to_string());
        self.sessions.lock().expect("sessions lock").get(&key).cloned()
    }

    pub fn actor_running(&self, group_id: &str, actor_id: &str) -> bool {
        self.session(group_id, actor_id)
            .is_some_and(|s| s.is_running())
    }

    pub fn group_running(&self, group_id: &str) -> bool {
        let gid = group_id.trim();
        if gid.is_empty() {
            return false;
        }
        self.sessions
            .lock()
            .expect("sessions lock")
            .iter()
            .any(|((g, _), s)| g == gid && s.is_running())
    }

    /// Spawn a session (or return the existing running one).
    pub fn start_actor(
        self: &Arc<Self>,
        group_id: &str,
        actor_id: &str,
        cwd: &Path,
        command: &[String],
        env: &HashMap<String, String>,
        max_backlog_bytes: usize,
    ) -> anyhow::Result<Arc<PtySession>> {
        let gid = group_id.trim();
        let aid = actor_id.trim();
        if gid.is_empty() || aid.is_empty() {
            anyhow::bail!("missing group_id/actor_id");
        }
        if let Some(existing) = self.session(gid, aid) {
            if existing.is_running() {
                return Ok(existing);
            }
        }

        let max_backlog = if max_backlog_bytes == 0 {
            DEFAULT_MAX_BACKLOG_BYTES
        } else {
            max_backlog_bytes
        };
        let (session, exit_rx) = PtySession::spawn(gid, aid, cwd, command, env, max_backlog)?;
        info!(group_id = gid, actor_id = aid, pid = session.pid(), "pty session started");

        self.sessions
            .lock()
            .expect("sessions lock")
            .insert((gid.to_string(), aid.to_string()), session.clone());

        // Exit monitor: mark the session dead, drop it from the map (only if
        // it is still the same session), then fire the exit hook.
        let supervisor = self.clone();
        let monitored = session.clone();
        tokio::spawn(async move {
            let code = exit_rx.await.unwrap_or(-1);
            monitored.mark_exited();
            info!(
                group_id = %monitored.group_id,
                actor_id = %monitored.actor_id,
                code,
                "pty session exited"
            );
            let key = (monitored.group_id.clone(), monitored.actor_id.clone());
            {
                let mut sessions = supervisor.sessions.lock().expect("sessions lock");
                if sessions
                    .get(&key)
                    .is_some_and(|s| Arc::ptr_eq(s, &monitored))
                {
                    sessions.remove(&key);
                }
            }
            let hook = supervisor.exit_hook.lock().expect("exit hook lock");
            if let Some(hook) = hook.as_ref() {
                hook(&monitored.group_id, &monitored.actor_id, monitored.pid());
            }
        });

        Ok(session)
    }

    pub async fn stop_actor(&self, group_id: &str, actor_id: &str) {
        let key = (group_id.trim().to_string(), actor_id.trim().to_string());
        let session = self.sessions.lock().expect("sessions lock").remove(&key);
        if let Some(session) = session {
            session.stop().await;
        }
    }

    pub async fn stop_group(&self, group_id: &str) {
        let gid = group_id.trim();
        if gid.is_empty() {
            return;
        }
        let drained: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            let keys: Vec<_> = sessions.keys().filter(|(g, _)| g == gid).cloned().collect();
            keys.into_iter().filter_map(|k| sessions.remove(&k)).collect()
        };
        for session in drained {
            session.stop().await;
        }
    }

    pub async fn stop_all(&self) {
        let drained: Vec<Arc<PtySession>> = {
            let mut sessions = self.sessions.lock().expect("sessions lock");
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in drained {
            session.stop().await;
        }
    }

    pub fn bracketed_paste_enabled(&self, group_id: &str, actor_id: &str) -> bool {
        self.session(group_id, actor_id)
            .is_some_and(|s| s.is_running() && s.bracketed_paste_enabled())
    }

    pub fn resize(&self, group_id: &str, actor_id: &str, cols: u16, rows: u16) {
        if let Some(session) = self.session(group_id, actor_id) {
            session.resize(cols, rows);
        }
    }

    pub async fn write_input(&self, group_id: &str, actor_id: &str, data: Vec<u8>) -> bool {
        match self.session(group_id, actor_id) {
            Some(session) => session.write_input(data).await,
            None => false,
        }
    }

    pub fn tail_output(&self, group_id: &str, actor_id: &str, max_bytes: usize) -> Vec<u8> {
        self.session(group_id, actor_id)
            .map(|s| s.tail_output(max_bytes))
            .unwrap_or_default()
    }

    /// Attach a raw client socket; fails when the actor is not running.
    pub fn attach(
        &self,
        group_id: &str,
        actor_id: &str,
        stream: UnixStream,
        pending_input: Vec<u8>,
    ) -> anyhow::Result<()> {
        let session = self
            .session(group_id, actor_id)
            .filter(|s| s.is_running())
            .ok_or_else(|| anyhow::anyhow!("actor is not running"))?;
        session.attach(stream, pending_input);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_ring_is_bounded() {
        let mut state = StreamState::new(100);
        for _ in 0..10 {
            state.append(&[b'x'; 40]);
        }
        // Bound may be exceeded by at most the size of the last chunk.
        assert!(state.backlog_bytes <= 100 + 40);
        let snap = state.snapshot(0);
        assert!(snap.iter().all(|&b| b == b'x'));
    }

    #[test]
    fn backlog_snapshot_returns_latest_bytes() {
        let mut state = StreamState::new(1000);
        state.append(b"first ");
        state.append(b"second ");
        state.append(b"third");
        assert_eq!(state.snapshot(0), b"first second third");
        let tail = state.snapshot(5);
        assert_eq!(tail, b"third");
    }

    #[test]
    fn bracketed_paste_follows_most_recent_sequence() {
        let mut state = StreamState::new(1000);
        assert!(!state.bracketed_paste);
        state.append(b"setup\x1b[?2004hready");
        assert!(state.bracketed_paste);
        state.append(b"bye\x1b[?2004l");
        assert!(!state.bracketed_paste);
        state.append(b"\x1b[?2004l...\x1b[?2004h");
        assert!(state.bracketed_paste);
    }

    #[test]
    fn bracketed_paste_detected_across_split_reads() {
        let mut state = StreamState::new(1000);
        let seq = b"\x1b[?2004h";
        state.append(&seq[..3]);
        assert!(!state.bracketed_paste);
        state.append(&seq[3..]);
        assert!(state.bracketed_paste);
    }

    #[test]
    fn rfind_locates_last_occurrence() {
        assert_eq!(rfind(b"abcabc", b"abc"), Some(3));
        assert_eq!(rfind(b"abc", b"xyz"), None);
        assert_eq!(rfind(b"ab", b"abc"), None);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn session_captures_output_and_accepts_input() {
        let supervisor = Arc::new(PtySupervisor::new());
        let dir = tempfile::tempdir().unwrap();
        let command = vec!["sh".to_string(), "-c".to_string(), "printf 'A\\nB\\nC\\n'; sleep 5".to_string()];
        let session = match supervisor.start_actor(
            "g_test",
            "actor",
            dir.path(),
            &command,
            &HashMap::new(),
            0,
        ) {
            Ok(s) => s,
            Err(e) => {
                // Restricted sandboxes may not allow openpty.
                eprintln!("skipping pty test: {e}");
                return;
            }
        };

        // Wait for the output to arrive in the backlog.
        let mut text = String::new();
        for _ in 0..50 {
            text = String::from_utf8_lossy(&session.tail_output(0)).to_string();
            if text.contains('C') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(text.contains('A') && text.contains('B') && text.contains('C'), "tail: {text:?}");

        assert!(supervisor.actor_running("g_test", "actor"));
        assert!(supervisor.group_running("g_test"));
        assert!(session.write_input(b"ignored\n".to_vec()).await);

        supervisor.stop_group("g_test").await;
        assert!(!supervisor.group_running("g_test"));
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn attached_clients_all_replay_the_backlog() {
        let supervisor = Arc::new(PtySupervisor::new());
        let dir = tempfile::tempdir().unwrap();
        let command = vec!["sh".to_string(), "-c".to_string(), "printf 'A\\nB\\nC\\n'; sleep 5".to_string()];
        let session = match supervisor.start_actor(
            "g_fan",
            "actor",
            dir.path(),
            &command,
            &HashMap::new(),
            0,
        ) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skipping pty test: {e}");
                return;
            }
        };
        // Let the output land in the backlog before anyone attaches.
        for _ in 0..50 {
            if String::from_utf8_lossy(&session.tail_output(0)).contains('C') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        async fn read_some(stream: &mut UnixStream) -> String {
            let mut collected = Vec::new();
            let mut buf = [0u8; 4096];
            for _ in 0..20 {
                match tokio::time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await
                {
                    Ok(Ok(n)) if n > 0 => collected.extend_from_slice(&buf[..n]),
                    _ => break,
                }
                if String::from_utf8_lossy(&collected).contains('C') {
                    break;
                }
            }
            String::from_utf8_lossy(&collected).to_string()
        }

        let (mut first, first_server) = UnixStream::pair().unwrap();
        session.attach(first_server, Vec::new());
        let replay_one = read_some(&mut first).await;
        assert!(replay_one.contains('A') && replay_one.contains('C'), "got {replay_one:?}");

        // A later client replays the same backlog.
        let (mut second, second_server) = UnixStream::pair().unwrap();
        session.attach(second_server, Vec::new());
        let replay_two = read_some(&mut second).await;
        assert!(replay_two.contains('A') && replay_two.contains('C'), "got {replay_two:?}");

        // First client holds the writer role; the second does not.
        {
            let clients = session.clients.lock().unwrap();
            assert_eq!(clients.attached.len(), 2);
            assert_eq!(clients.writer, Some(1));
        }
        first.write_all(b"typed\n").await.unwrap();

        // Writer disconnect promotes the remaining client.
        drop(first);
        for _ in 0..50 {
            if session.clients.lock().unwrap().writer == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(session.clients.lock().unwrap().writer, Some(2));

        supervisor.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn start_actor_returns_existing_running_session() {
        let supervisor = Arc::new(PtySupervisor::new());
        let dir = tempfile::tempdir().unwrap();
        let command = vec!["sleep".to_string(), "5".to_string()];
        let first = match supervisor.start_actor("g", "a", dir.path(), &command, &HashMap::new(), 0)
        {
            Ok(s) => s,
            Err(e) => {
                eprintln!("skipping pty test: {e}");
                return;
            }
        };
        let second = supervisor
            .start_actor("g", "a", dir.path(), &command, &HashMap::new(), 0)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        supervisor.stop_all().await;
    }
}
