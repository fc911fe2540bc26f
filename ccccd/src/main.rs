mod automation;
mod delivery;
mod headless;
mod ops;
mod pty;
mod runner_state;
mod server;
mod streaming;
mod system_prompt;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;

use cccc_core::ipc::{DaemonRequest, DaemonResponse, call_daemon};
use cccc_core::ledger::read_last_lines;
use cccc_core::paths;

#[derive(Parser, Debug)]
#[command(name = "cccc", version, about = "Multi-agent collaboration kernel")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a project root to a working group (creating one if needed).
    Attach(AttachArgs),
    /// Manage working groups.
    Group(GroupArgs),
    /// List all working groups.
    Groups,
    /// Manage actors in a group.
    Actor(ActorArgs),
    /// Attach this terminal to an actor's session (raw mode).
    Term(TermArgs),
    /// Send a chat message into a group.
    Send(SendArgs),
    /// Print (or follow) a group's ledger.
    Tail(TailArgs),
    /// Stream live conversation events from the daemon.
    Events(EventsArgs),
    /// Show an actor's unread inbox.
    Inbox(InboxArgs),
    /// Control the background daemon.
    Daemon(DaemonArgs),
    /// Print the version.
    Version,
}

#[derive(clap::Args, Debug)]
struct AttachArgs {
    /// Project root to attach.
    path: PathBuf,
    /// Attach to this group instead of the scope default.
    #[arg(long = "group")]
    group_id: Option<String>,
    #[arg(long, default_value = "user")]
    by: String,
}

#[derive(clap::Args, Debug)]
struct GroupArgs {
    #[command(subcommand)]
    command: GroupCommand,
}

#[derive(Subcommand, Debug)]
enum GroupCommand {
    /// Create an empty working group.
    Create {
        #[arg(long, default_value = "working-group")]
        title: String,
        #[arg(long, default_value = "")]
        topic: String,
    },
    /// Show a group document.
    Show { group_id: String },
    /// Set the active scope of a group from a path.
    Use {
        group_id: String,
        #[arg(long, default_value = ".")]
        path: PathBuf,
    },
    /// Start all enabled actors.
    Start { group_id: String },
    /// Stop all actors.
    Stop { group_id: String },
    /// Delete a group and its state.
    Delete { group_id: String },
    /// Export the group as a portable template (YAML to stdout or a file).
    Export {
        group_id: String,
        #[arg(short = 'o', long = "out")]
        out: Option<PathBuf>,
    },
    /// Apply a template file to the group (replaces roster and settings).
    Import {
        group_id: String,
        template: PathBuf,
        /// Show the diff without applying.
        #[arg(long = "dry-run")]
        dry_run: bool,
    },
}

#[derive(clap::Args, Debug)]
struct EventsArgs {
    group_id: String,
    /// Observe as this identity (actors get a scoped view).
    #[arg(long, default_value = "user")]
    by: String,
    /// Restrict to specific kinds (repeatable).
    #[arg(long = "kind")]
    kinds: Vec<String>,
}

#[derive(clap::Args, Debug)]
struct ActorArgs {
    #[command(subcommand)]
    command: ActorCommand,
}

#[derive(Subcommand, Debug)]
enum ActorCommand {
    /// List actors with their effective roles.
    List { group_id: String },
    /// Add an actor. The first enabled actor becomes the foreman.
    Add {
        group_id: String,
        actor_id: String,
        #[arg(long, default_value = "")]
        title: String,
        /// Agent runtime (claude, codex, droid, …, custom).
        #[arg(long)]
        runtime: Option<String>,
        /// Runner kind: pty or headless.
        #[arg(long)]
        runner: Option<String>,
        /// Command override (repeatable); defaults come from the runtime.
        #[arg(long = "cmd")]
        command: Vec<String>,
        #[arg(long, default_value = "user")]
        by: String,
    },
    /// Remove an actor.
    Remove {
        group_id: String,
        actor_id: String,
        #[arg(long, default_value = "user")]
        by: String,
    },
    /// Enable (and if the group is running, spawn) an actor.
    Start {
        group_id: String,
        actor_id: String,
        #[arg(long, default_value = "user")]
        by: String,
    },
    /// Disable and stop an actor.
    Stop {
        group_id: String,
        actor_id: String,
        #[arg(long, default_value = "user")]
        by: String,
    },
    /// Restart an actor's session.
    Restart {
        group_id: String,
        actor_id: String,
        #[arg(long, default_value = "user")]
        by: String,
    },
}

#[derive(clap::Args, Debug)]
struct TermArgs {
    group_id: String,
    actor_id: String,
}

#[derive(clap::Args, Debug)]
struct SendArgs {
    group_id: String,
    text: String,
    #[arg(long, default_value = "user")]
    by: String,
    /// Recipient tokens (repeatable): actor id, title, @all, @peers, @foreman, user.
    #[arg(long = "to")]
    to: Vec<String>,
    /// Validate against this project root's scope.
    #[arg(long, default_value = "")]
    path: String,
    /// Event id this message replies to.
    #[arg(long = "reply-to", default_value = "")]
    reply_to: String,
}

#[derive(clap::Args, Debug)]
struct TailArgs {
    group_id: String,
    /// Number of trailing events.
    #[arg(short = 'n', long = "lines", default_value_t = 20)]
    lines: usize,
    /// Keep following the ledger.
    #[arg(short = 'f', long = "follow")]
    follow: bool,
}

#[derive(clap::Args, Debug)]
struct InboxArgs {
    /// Group id; defaults to the active group.
    #[arg(long = "group")]
    group_id: Option<String>,
    #[arg(long = "actor-id")]
    actor_id: String,
    #[arg(long)]
    by: String,
    /// Advance the read cursor past everything listed.
    #[arg(long = "mark-read")]
    mark_read: bool,
    #[arg(long, default_value_t = 50)]
    limit: usize,
}

#[derive(clap::Args, Debug)]
struct DaemonArgs {
    #[command(subcommand)]
    command: DaemonCommand,
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    /// Run the daemon in the foreground.
    Start,
    /// Ask a running daemon to shut down.
    Stop,
    /// Check whether a daemon is serving.
    Status,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let home = cccc_core::paths::ensure_home().context("failed to create CCCC home")?;
    let sock = paths::socket_path(&home);

    match cli.command {
        Command::Version => {
            println!("cccc {}", cccc_core::VERSION);
            Ok(ExitCode::SUCCESS)
        }
        Command::Daemon(args) => match args.command {
            DaemonCommand::Start => {
                let runtime = tokio::runtime::Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("failed to build tokio runtime")?;
                let code = runtime.block_on(server::serve(home))?;
                Ok(ExitCode::from(code as u8))
            }
            DaemonCommand::Stop => {
                let resp = call_daemon(&sock, &DaemonRequest::new("shutdown", Value::Null));
                finish(resp, |_| println!("daemon stopping"))
            }
            DaemonCommand::Status => {
                let resp = call_daemon(&sock, &DaemonRequest::new("ping", Value::Null));
                finish(resp, |result| {
                    println!(
                        "daemon running (pid {}, version {})",
                        result["pid"], result["version"]
                    );
                })
            }
        },
        Command::Attach(args) => {
            let path = args
                .path
                .canonicalize()
                .unwrap_or(args.path)
                .to_string_lossy()
                .to_string();
            let mut req_args = serde_json::json!({"path": path, "by": args.by});
            if let Some(gid) = args.group_id {
                req_args["group_id"] = Value::String(gid);
            }
            let resp = call_daemon(&sock, &DaemonRequest::new("attach", req_args));
            finish(resp, |result| {
                println!(
                    "attached {} (scope {})",
                    result["group_id"].as_str().unwrap_or(""),
                    result["scope_key"].as_str().unwrap_or("")
                );
            })
        }
        Command::Groups => {
            let resp = call_daemon(&sock, &DaemonRequest::new("groups", serde_json::json!({})));
            finish(resp, |result| {
                for group in result["groups"].as_array().into_iter().flatten() {
                    println!(
                        "{}  {}  running={}",
                        group["group_id"].as_str().unwrap_or(""),
                        group["title"].as_str().unwrap_or(""),
                        group["running"].as_bool().unwrap_or(false)
                    );
                }
            })
        }
        Command::Group(args) => run_group(&sock, args),
        Command::Actor(args) => run_actor(&sock, args),
        Command::Term(args) => run_term(&sock, args),
        Command::Send(args) => {
            let req = DaemonRequest::new(
                "send",
                serde_json::json!({
                    "group_id": args.group_id,
                    "text": args.text,
                    "by": args.by,
                    "to": args.to,
                    "path": args.path,
                    "reply_to": args.reply_to,
                }),
            );
            let resp = call_daemon(&sock, &req);
            finish(resp, |result| {
                println!("sent {}", result["event"]["id"].as_str().unwrap_or(""));
            })
        }
        Command::Tail(args) => run_tail(&home, args),
        Command::Events(args) => run_events(&sock, args),
        Command::Inbox(args) => run_inbox(&home, &sock, args),
    }
}

fn run_group(sock: &std::path::Path, args: GroupArgs) -> anyhow::Result<ExitCode> {
    match args.command {
        GroupCommand::Create { title, topic } => {
            let req = DaemonRequest::new(
                "group_create",
                serde_json::json!({"title": title, "topic": topic, "by": "user"}),
            );
            finish(call_daemon(sock, &req), |result| {
                println!("{}", result["group_id"].as_str().unwrap_or(""));
            })
        }
        GroupCommand::Show { group_id } => {
            let req = DaemonRequest::new("group_show", serde_json::json!({"group_id": group_id}));
            finish(call_daemon(sock, &req), |result| {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&result["group"]).unwrap_or_default()
                );
            })
        }
        GroupCommand::Use { group_id, path } => {
            let path = path.canonicalize().unwrap_or(path);
            let req = DaemonRequest::new(
                "group_use",
                serde_json::json!({
                    "group_id": group_id,
                    "path": path.to_string_lossy(),
                    "by": "user",
                }),
            );
            finish(call_daemon(sock, &req), |result| {
                println!(
                    "active scope {}",
                    result["active_scope_key"].as_str().unwrap_or("")
                );
            })
        }
        GroupCommand::Start { group_id } => {
            let req = DaemonRequest::new(
                "group_start",
                serde_json::json!({"group_id": group_id, "by": "user"}),
            );
            finish(call_daemon(sock, &req), |result| {
                println!(
                    "started: {}",
                    result["started"]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(", "))
                        .unwrap_or_default()
                );
            })
        }
        GroupCommand::Stop { group_id } => {
            let req = DaemonRequest::new(
                "group_stop",
                serde_json::json!({"group_id": group_id, "by": "user"}),
            );
            finish(call_daemon(sock, &req), |_| println!("stopped"))
        }
        GroupCommand::Delete { group_id } => {
            let req = DaemonRequest::new(
                "group_delete",
                serde_json::json!({"group_id": group_id, "by": "user"}),
            );
            finish(call_daemon(sock, &req), |_| println!("deleted"))
        }
        GroupCommand::Export { group_id, out } => {
            let req = DaemonRequest::new(
                "group_export_template",
                serde_json::json!({"group_id": group_id}),
            );
            let resp = call_daemon(sock, &req);
            if !resp.ok {
                return finish(resp, |_| {});
            }
            let yaml = resp.result["template"].as_str().unwrap_or("").to_string();
            match out {
                Some(path) => {
                    std::fs::write(&path, &yaml)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("exported to {}", path.display());
                }
                None => print!("{yaml}"),
            }
            Ok(ExitCode::SUCCESS)
        }
        GroupCommand::Import { group_id, template, dry_run } => {
            let text = std::fs::read_to_string(&template)
                .with_context(|| format!("failed to read {}", template.display()))?;
            let req = DaemonRequest::new(
                "group_apply_template",
                serde_json::json!({
                    "group_id": group_id,
                    "template": text,
                    "by": "user",
                    "dry_run": dry_run,
                }),
            );
            finish(call_daemon(sock, &req), |result| {
                let diff = &result["diff"];
                let list = |key: &str| {
                    diff[key]
                        .as_array()
                        .map(|a| a.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(", "))
                        .unwrap_or_default()
                };
                println!(
                    "add: [{}]  update: [{}]  remove: [{}]  settings: [{}]",
                    list("actors_add"),
                    list("actors_update"),
                    list("actors_remove"),
                    list("settings_changed"),
                );
                if result["applied"].as_bool().unwrap_or(false) {
                    println!("applied");
                } else {
                    println!("dry run only");
                }
            })
        }
    }
}

/// Stream conversation events over the daemon socket as NDJSON.
fn run_events(sock: &std::path::Path, args: EventsArgs) -> anyhow::Result<ExitCode> {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    let stream = match UnixStream::connect(sock) {
        Ok(stream) => stream,
        Err(_) => {
            eprintln!("error [daemon_unavailable]: daemon unavailable");
            return Ok(ExitCode::from(1));
        }
    };
    let request = DaemonRequest::new(
        "events_stream",
        serde_json::json!({
            "group_id": args.group_id,
            "by": args.by,
            "kinds": args.kinds,
        }),
    );
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    (&stream).write_all(line.as_bytes())?;

    let mut reader = BufReader::new(stream);
    let mut ack = String::new();
    reader.read_line(&mut ack)?;
    let ack: DaemonResponse = serde_json::from_str(ack.trim_end())
        .unwrap_or_else(|_| DaemonResponse::daemon_unavailable());
    if !ack.ok {
        return finish(ack, |_| {});
    }

    loop {
        let mut event_line = String::new();
        match reader.read_line(&mut event_line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = event_line.trim_end();
                if !text.is_empty() {
                    println!("{text}");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn run_actor(sock: &std::path::Path, args: ActorArgs) -> anyhow::Result<ExitCode> {
    match args.command {
        ActorCommand::List { group_id } => {
            let req = DaemonRequest::new(
                "actor_list",
                serde_json::json!({"group_id": group_id, "by": "user"}),
            );
            finish(call_daemon(sock, &req), |result| {
                for actor in result["actors"].as_array().into_iter().flatten() {
                    let enabled = actor["enabled"].as_bool().unwrap_or(true);
                    println!(
                        "{}  {}  role={} runner={} enabled={}",
                        actor["id"].as_str().unwrap_or(""),
                        actor["title"].as_str().unwrap_or(""),
                        actor["role"].as_str().unwrap_or("peer"),
                        actor["runner"].as_str().unwrap_or("pty"),
                        enabled
                    );
                }
            })
        }
        ActorCommand::Add {
            group_id,
            actor_id,
            title,
            runtime,
            runner,
            command,
            by,
        } => {
            let mut req_args = serde_json::json!({
                "group_id": group_id,
                "actor_id": actor_id,
                "title": title,
                "command": command,
                "by": by,
            });
            if let Some(runtime) = runtime {
                req_args["runtime"] = Value::String(runtime);
            }
            if let Some(runner) = runner {
                req_args["runner"] = Value::String(runner);
            }
            let req = DaemonRequest::new("actor_add", req_args);
            finish(call_daemon(sock, &req), |result| {
                println!(
                    "added {} (role {})",
                    result["actor"]["id"].as_str().unwrap_or(""),
                    result["actor"]["role"].as_str().unwrap_or("peer")
                );
            })
        }
        ActorCommand::Remove { group_id, actor_id, by } => {
            let req = DaemonRequest::new(
                "actor_remove",
                serde_json::json!({"group_id": group_id, "actor_id": actor_id, "by": by}),
            );
            finish(call_daemon(sock, &req), |_| println!("removed"))
        }
        ActorCommand::Start { group_id, actor_id, by } => {
            let req = DaemonRequest::new(
                "actor_start",
                serde_json::json!({"group_id": group_id, "actor_id": actor_id, "by": by}),
            );
            finish(call_daemon(sock, &req), |_| println!("started"))
        }
        ActorCommand::Stop { group_id, actor_id, by } => {
            let req = DaemonRequest::new(
                "actor_stop",
                serde_json::json!({"group_id": group_id, "actor_id": actor_id, "by": by}),
            );
            finish(call_daemon(sock, &req), |_| println!("stopped"))
        }
        ActorCommand::Restart { group_id, actor_id, by } => {
            let req = DaemonRequest::new(
                "actor_restart",
                serde_json::json!({"group_id": group_id, "actor_id": actor_id, "by": by}),
            );
            finish(call_daemon(sock, &req), |_| println!("restarted"))
        }
    }
}

/// Attach this terminal to an actor's pty. After the daemon's ack, the
/// connection is a raw byte channel: stdin → pty, pty → stdout.
fn run_term(sock: &std::path::Path, args: TermArgs) -> anyhow::Result<ExitCode> {
    use std::io::{BufRead, BufReader, Read, Write};
    use std::os::unix::net::UnixStream;

    let stream = match UnixStream::connect(sock) {
        Ok(stream) => stream,
        Err(_) => {
            eprintln!("error [daemon_unavailable]: daemon unavailable");
            return Ok(ExitCode::from(1));
        }
    };
    let request = DaemonRequest::new(
        "term_attach",
        serde_json::json!({"group_id": args.group_id, "actor_id": args.actor_id}),
    );
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    (&stream).write_all(line.as_bytes())?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut ack = String::new();
    reader.read_line(&mut ack)?;
    let ack: DaemonResponse = serde_json::from_str(ack.trim_end())
        .unwrap_or_else(|_| DaemonResponse::daemon_unavailable());
    if !ack.ok {
        return finish(ack, |_| {});
    }

    // Raw mode so control sequences reach the actor's CLI unmangled.
    let raw_guard = RawTerminal::enable();
    eprintln!("[attached to {} — detach with Ctrl-D on a fresh line]", args.actor_id);

    // pty → stdout on its own thread; stdin → pty on this one.
    let mut output = stream.try_clone()?;
    let pump = std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = [0u8; 8192];
        loop {
            match output.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout.write_all(&buf[..n]).is_err() {
                        break;
                    }
                    let _ = stdout.flush();
                }
            }
        }
    });

    let mut stdin = std::io::stdin();
    let mut buf = [0u8; 8192];
    loop {
        match stdin.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if (&stream).write_all(&buf[..n]).is_err() {
                    break;
                }
            }
        }
    }

    let _ = stream.shutdown(std::net::Shutdown::Both);
    let _ = pump.join();
    drop(raw_guard);
    Ok(ExitCode::SUCCESS)
}

/// Puts the controlling terminal into raw mode; restores on drop.
struct RawTerminal {
    saved: Option<libc::termios>,
}

impl RawTerminal {
    fn enable() -> Self {
        unsafe {
            let mut saved: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(libc::STDIN_FILENO, &mut saved) != 0 {
                return Self { saved: None };
            }
            let mut raw = saved;
            libc::cfmakeraw(&mut raw);
            if libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) != 0 {
                return Self { saved: None };
            }
            Self { saved: Some(saved) }
        }
    }
}

impl Drop for RawTerminal {
    fn drop(&mut self) {
        if let Some(saved) = self.saved {
            unsafe {
                let _ = libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &saved);
            }
        }
    }
}

/// Tail reads the ledger file directly; only writes go through the daemon.
fn run_tail(home: &std::path::Path, args: TailArgs) -> anyhow::Result<ExitCode> {
    let ledger = paths::group_dir(home, &args.group_id).join("ledger.jsonl");
    if !ledger.exists() {
        eprintln!("error: group not found: {}", args.group_id);
        return Ok(ExitCode::from(1));
    }
    for line in read_last_lines(&ledger, args.lines) {
        println!("{line}");
    }
    if !args.follow {
        return Ok(ExitCode::SUCCESS);
    }

    let mut follower = cccc_core::ledger::LedgerFollower::from_end(&ledger);
    loop {
        std::thread::sleep(Duration::from_millis(200));
        for line in follower.poll_lines() {
            println!("{line}");
        }
    }
}

fn run_inbox(
    home: &std::path::Path,
    sock: &std::path::Path,
    args: InboxArgs,
) -> anyhow::Result<ExitCode> {
    let group_id = match args.group_id {
        Some(gid) => gid,
        None => {
            let active = cccc_core::active::load_active(home).active_group_id;
            if active.is_empty() {
                eprintln!("error: no active group; pass --group <gid>");
                return Ok(ExitCode::from(1));
            }
            active
        }
    };

    let req = DaemonRequest::new(
        "inbox_list",
        serde_json::json!({
            "group_id": group_id,
            "actor_id": args.actor_id,
            "by": args.by,
            "limit": args.limit,
        }),
    );
    let resp = call_daemon(sock, &req);
    if !resp.ok {
        return finish(resp, |_| {});
    }

    let messages = resp.result["messages"].as_array().cloned().unwrap_or_default();
    for message in &messages {
        let to = message["data"]["to"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect::<Vec<_>>().join(", "))
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "@all".to_string());
        println!(
            "{}  {} → {}: {}",
            message["ts"].as_str().unwrap_or(""),
            message["by"].as_str().unwrap_or(""),
            to,
            message["data"]["text"].as_str().unwrap_or("")
        );
    }
    if messages.is_empty() {
        println!("(inbox empty)");
    }

    if args.mark_read {
        if let Some(last_id) = messages.last().and_then(|m| m["id"].as_str()) {
            let req = DaemonRequest::new(
                "inbox_mark_read",
                serde_json::json!({
                    "group_id": group_id,
                    "actor_id": args.actor_id,
                    "event_id": last_id,
                    "by": args.by,
                }),
            );
            let resp = call_daemon(sock, &req);
            if !resp.ok {
                return finish(resp, |_| {});
            }
            println!("marked read through {last_id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Print a success view or the error, mapping failures to exit code 1.
fn finish(resp: DaemonResponse, on_ok: impl FnOnce(&Value)) -> anyhow::Result<ExitCode> {
    if resp.ok {
        on_ok(&resp.result);
        Ok(ExitCode::SUCCESS)
    } else {
        let (code, message) = resp
            .error
            .as_ref()
            .map(|e| (e.code.as_str(), e.message.as_str()))
            .unwrap_or(("unknown", "unknown error"));
        eprintln!("error [{code}]: {message}");
        Ok(ExitCode::from(1))
    }
}
