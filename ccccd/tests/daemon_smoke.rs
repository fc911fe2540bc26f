//! Smoke integration tests for ccccd.
//!
//! These spawn the actual `cccc` binary with an isolated `CCCC_HOME`, then
//! drive the daemon over its Unix socket: attach, send, inbox cursors, and
//! the permission matrix. No PTY actors are started — session-level behavior
//! is covered by unit tests.

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use cccc_core::ipc::{DaemonRequest, DaemonResponse, call_daemon};

fn cccc_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "cccc", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/cccc")
}

struct TestDaemon {
    child: Child,
    home: tempfile::TempDir,
}

impl TestDaemon {
    fn start() -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let child = Command::new(cccc_binary())
            .args(["daemon", "start"])
            .env("CCCC_HOME", home.path())
            .env("RUST_LOG", "warn")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn cccc daemon");

        let daemon = TestDaemon { child, home };
        daemon.wait_ready();
        daemon
    }

    fn sock(&self) -> PathBuf {
        self.home.path().join("daemon/ccccd.sock")
    }

    fn wait_ready(&self) {
        for _ in 0..50 {
            let resp = call_daemon(&self.sock(), &DaemonRequest::new("ping", serde_json::Value::Null));
            if resp.ok {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("ccccd did not become ready within 5 seconds");
    }

    fn call(&self, op: &str, args: serde_json::Value) -> DaemonResponse {
        call_daemon(&self.sock(), &DaemonRequest::new(op, args))
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        let _ = self.call("shutdown", serde_json::Value::Null);
        std::thread::sleep(Duration::from_millis(200));
        unsafe {
            libc::kill(self.child.id() as i32, libc::SIGTERM);
        }
        let _ = self.child.wait();
    }
}

#[test]
fn ping_reports_version_and_pid() {
    let daemon = TestDaemon::start();
    let resp = daemon.call("ping", serde_json::json!({}));
    assert!(resp.ok);
    assert!(resp.result["pid"].is_number());
    assert!(resp.result["version"].is_string());
}

#[test]
fn attach_then_send_lands_in_the_ledger() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();

    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    assert!(attach.ok, "attach failed: {:?}", attach.error);
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();
    assert!(group_id.starts_with("g_"));
    assert!(attach.result["scope_key"].as_str().unwrap().starts_with("s_"));

    let send = daemon.call(
        "send",
        serde_json::json!({
            "group_id": group_id,
            "text": "hello",
            "by": "user",
            "to": ["@all"],
        }),
    );
    assert!(send.ok, "send failed: {:?}", send.error);

    let ledger = daemon
        .home
        .path()
        .join("groups")
        .join(&group_id)
        .join("ledger.jsonl");
    let lines = cccc_core::ledger::read_last_lines(&ledger, 2);
    assert_eq!(lines.len(), 2);
    let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
    let second: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    assert_eq!(first["kind"], "group.attach");
    assert_eq!(second["kind"], "chat.message");
    assert_eq!(second["data"]["text"], "hello");
    assert_eq!(second["data"]["to"], serde_json::json!(["@all"]));
}

#[test]
fn inbox_mark_read_advances_cursor() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let add = daemon.call(
        "actor_add",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "user"}),
    );
    assert!(add.ok, "actor_add failed: {:?}", add.error);

    for text in ["one", "two"] {
        let resp = daemon.call(
            "send",
            serde_json::json!({"group_id": group_id, "text": text, "by": "user", "to": []}),
        );
        assert!(resp.ok);
    }

    let inbox = daemon.call(
        "inbox_list",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "peer-a"}),
    );
    assert!(inbox.ok);
    let messages = inbox.result["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    let last_id = messages[1]["id"].as_str().unwrap();
    let last_ts = messages[1]["ts"].as_str().unwrap();

    let mark = daemon.call(
        "inbox_mark_read",
        serde_json::json!({
            "group_id": group_id,
            "actor_id": "peer-a",
            "event_id": last_id,
            "by": "peer-a",
        }),
    );
    assert!(mark.ok);

    let inbox = daemon.call(
        "inbox_list",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "peer-a"}),
    );
    assert!(inbox.result["messages"].as_array().unwrap().is_empty());

    let cursors: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(
            daemon
                .home
                .path()
                .join("groups")
                .join(&group_id)
                .join("state/read_cursors.json"),
        )
        .unwrap(),
    )
    .unwrap();
    assert_eq!(cursors["peer-a"]["event_id"], last_id);
    assert_eq!(cursors["peer-a"]["ts"], last_ts);
}

#[test]
fn peers_cannot_start_other_actors() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    for actor in ["foreman-1", "peer-a"] {
        let resp = daemon.call(
            "actor_add",
            serde_json::json!({"group_id": group_id, "actor_id": actor, "by": "user"}),
        );
        assert!(resp.ok);
    }

    let denied = daemon.call(
        "actor_start",
        serde_json::json!({"group_id": group_id, "actor_id": "foreman-1", "by": "peer-a"}),
    );
    assert!(!denied.ok);
    assert_eq!(denied.error_code(), Some("permission_denied"));

    // A peer may stop itself.
    let allowed = daemon.call(
        "actor_stop",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "peer-a"}),
    );
    assert!(allowed.ok, "self-stop failed: {:?}", allowed.error);
}

#[test]
fn reserved_actor_ids_are_rejected() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let resp = daemon.call(
        "actor_add",
        serde_json::json!({"group_id": group_id, "actor_id": "user", "by": "user"}),
    );
    assert!(!resp.ok);
    assert_eq!(resp.error_code(), Some("actor_add_failed"));
}

#[test]
fn term_attach_to_stopped_actor_fails_cleanly() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let resp = daemon.call(
        "term_attach",
        serde_json::json!({"group_id": group_id, "actor_id": "ghost"}),
    );
    assert!(!resp.ok);
    assert_eq!(resp.error_code(), Some("actor_not_running"));

    // The connection was not switched to raw mode: a fresh request still works.
    let ping = daemon.call("ping", serde_json::json!({}));
    assert!(ping.ok);
}

#[test]
fn unknown_group_and_unknown_op_report_codes() {
    let daemon = TestDaemon::start();
    let resp = daemon.call("group_show", serde_json::json!({"group_id": "g_missing"}));
    assert_eq!(resp.error_code(), Some("group_not_found"));

    let resp = daemon.call("group_show", serde_json::json!({}));
    assert_eq!(resp.error_code(), Some("missing_group_id"));

    let resp = daemon.call("frobnicate", serde_json::json!({}));
    assert_eq!(resp.error_code(), Some("unknown_op"));
}

#[test]
fn send_with_unattached_path_is_rejected() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let elsewhere = tempfile::tempdir().unwrap();
    let resp = daemon.call(
        "send",
        serde_json::json!({
            "group_id": group_id,
            "text": "hi",
            "by": "user",
            "to": [],
            "path": elsewhere.path().to_string_lossy(),
        }),
    );
    assert!(!resp.ok);
    assert_eq!(resp.error_code(), Some("scope_not_attached"));
}

#[test]
fn group_start_fails_on_missing_project_root() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();
    let add = daemon.call(
        "actor_add",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "user"}),
    );
    assert!(add.ok);

    // The attached directory vanishes before start.
    drop(project);
    let resp = daemon.call(
        "group_start",
        serde_json::json!({"group_id": group_id, "by": "user"}),
    );
    assert!(!resp.ok);
    assert_eq!(resp.error_code(), Some("invalid_project_root"));

    // Nothing was spawned and the group is not marked running.
    let show = daemon.call("group_show", serde_json::json!({"group_id": group_id}));
    assert_eq!(show.result["group"]["running"], false);
    assert_eq!(show.result["running"], false);
}

#[test]
fn events_stream_delivers_live_chat_messages() {
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixStream;

    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();
    let add = daemon.call(
        "actor_add",
        serde_json::json!({"group_id": group_id, "actor_id": "peer-a", "by": "user"}),
    );
    assert!(add.ok);

    // Open the stream as peer-a: the view is scoped to its targeting.
    let stream = UnixStream::connect(daemon.sock()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let request = DaemonRequest::new(
        "events_stream",
        serde_json::json!({"group_id": group_id, "by": "peer-a"}),
    );
    let mut line = serde_json::to_string(&request).unwrap();
    line.push('\n');
    (&stream).write_all(line.as_bytes()).unwrap();

    let mut reader = BufReader::new(&stream);
    let mut ack = String::new();
    reader.read_line(&mut ack).unwrap();
    let ack: DaemonResponse = serde_json::from_str(ack.trim_end()).unwrap();
    assert!(ack.ok, "stream ack failed: {:?}", ack.error);

    // Sent after the subscription; the actor message arrives, the
    // group-internal event does not.
    let send = daemon.call(
        "send",
        serde_json::json!({"group_id": group_id, "text": "streamed", "by": "user", "to": ["peer-a"]}),
    );
    assert!(send.ok);

    let mut event_line = String::new();
    reader.read_line(&mut event_line).unwrap();
    let event: serde_json::Value = serde_json::from_str(event_line.trim_end()).unwrap();
    assert_eq!(event["kind"], "chat.message");
    assert_eq!(event["data"]["text"], "streamed");

    drop(reader);
    drop(stream);
}

#[test]
fn headless_actors_report_status_through_the_daemon() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let add = daemon.call(
        "actor_add",
        serde_json::json!({
            "group_id": group_id,
            "actor_id": "mcp-1",
            "runner": "headless",
            "by": "user",
        }),
    );
    assert!(add.ok, "actor_add failed: {:?}", add.error);

    // No session before the group starts.
    let none = daemon.call(
        "headless_status",
        serde_json::json!({"group_id": group_id, "actor_id": "mcp-1"}),
    );
    assert_eq!(none.error_code(), Some("session_not_found"));

    let start = daemon.call(
        "group_start",
        serde_json::json!({"group_id": group_id, "by": "user"}),
    );
    assert!(start.ok, "group_start failed: {:?}", start.error);

    let status = daemon.call(
        "headless_status",
        serde_json::json!({"group_id": group_id, "actor_id": "mcp-1"}),
    );
    assert!(status.ok);
    assert_eq!(status.result["state"]["status"], "idle");

    let set = daemon.call(
        "headless_set_status",
        serde_json::json!({
            "group_id": group_id,
            "actor_id": "mcp-1",
            "status": "working",
            "task_id": "t-1",
        }),
    );
    assert!(set.ok);
    assert_eq!(set.result["state"]["status"], "working");

    let ack = daemon.call(
        "headless_ack_message",
        serde_json::json!({
            "group_id": group_id,
            "actor_id": "mcp-1",
            "message_id": "ev-42",
        }),
    );
    assert!(ack.ok);

    let invalid = daemon.call(
        "headless_set_status",
        serde_json::json!({"group_id": group_id, "actor_id": "mcp-1", "status": "zzz"}),
    );
    assert_eq!(invalid.error_code(), Some("invalid_status"));

    // A headless message lands in the file mailbox, not a PTY.
    let send = daemon.call(
        "send",
        serde_json::json!({
            "group_id": group_id,
            "text": "please summarize",
            "by": "user",
            "to": ["mcp-1"],
        }),
    );
    assert!(send.ok);
    let inbox_dir = daemon
        .home
        .path()
        .join("groups")
        .join(&group_id)
        .join("state/mailbox/mcp-1/inbox");
    let files: Vec<_> = std::fs::read_dir(&inbox_dir).unwrap().flatten().collect();
    assert_eq!(files.len(), 1);
    assert!(
        files[0]
            .file_name()
            .to_string_lossy()
            .starts_with("000001.")
    );
}

#[test]
fn template_export_apply_round_trip() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();
    for actor in ["lead", "peer-a"] {
        let resp = daemon.call(
            "actor_add",
            serde_json::json!({"group_id": group_id, "actor_id": actor, "by": "user"}),
        );
        assert!(resp.ok);
    }

    let export = daemon.call(
        "group_export_template",
        serde_json::json!({"group_id": group_id}),
    );
    assert!(export.ok);
    let yaml = export.result["template"].as_str().unwrap().to_string();
    assert!(yaml.contains("cccc.group_template"));

    // Dry run of the unmodified template shows no changes.
    let preview = daemon.call(
        "group_apply_template",
        serde_json::json!({"group_id": group_id, "template": yaml, "by": "user", "dry_run": true}),
    );
    assert!(preview.ok);
    assert_eq!(preview.result["applied"], false);
    assert!(preview.result["diff"]["actors_add"].as_array().unwrap().is_empty());
    assert!(preview.result["diff"]["actors_remove"].as_array().unwrap().is_empty());

    // Garbage is rejected with a stable code.
    let bad = daemon.call(
        "group_apply_template",
        serde_json::json!({"group_id": group_id, "template": "kind: nope", "by": "user"}),
    );
    assert_eq!(bad.error_code(), Some("invalid_template"));

    // Applying a template that drops peer-a removes it from the roster.
    let mut template = serde_yaml_to_json(&yaml);
    template["actors"]
        .as_array_mut()
        .unwrap()
        .retain(|a| a["id"] == "lead");
    let edited_yaml = json_to_yaml(&template);
    let apply = daemon.call(
        "group_apply_template",
        serde_json::json!({"group_id": group_id, "template": edited_yaml, "by": "user"}),
    );
    assert!(apply.ok, "apply failed: {:?}", apply.error);
    assert_eq!(
        apply.result["diff"]["actors_remove"],
        serde_json::json!(["peer-a"])
    );
    let actors = daemon.call(
        "actor_list",
        serde_json::json!({"group_id": group_id, "by": "user"}),
    );
    assert_eq!(actors.result["actors"].as_array().unwrap().len(), 1);
}

fn serde_yaml_to_json(yaml: &str) -> serde_json::Value {
    // Templates are YAML on the wire; tests edit them as JSON for precision.
    let parsed: serde_json::Value = serde_yaml::from_str(yaml).unwrap();
    parsed
}

fn json_to_yaml(value: &serde_json::Value) -> String {
    serde_yaml::to_string(value).unwrap()
}

#[test]
fn group_set_state_pauses_and_resumes() {
    let daemon = TestDaemon::start();
    let project = tempfile::tempdir().unwrap();
    let attach = daemon.call(
        "attach",
        serde_json::json!({"path": project.path().to_string_lossy(), "by": "user"}),
    );
    let group_id = attach.result["group_id"].as_str().unwrap().to_string();

    let pause = daemon.call(
        "group_set_state",
        serde_json::json!({"group_id": group_id, "state": "paused", "by": "user"}),
    );
    assert!(pause.ok);
    let show = daemon.call("group_show", serde_json::json!({"group_id": group_id}));
    assert_eq!(show.result["group"]["state"], "paused");

    let invalid = daemon.call(
        "group_set_state",
        serde_json::json!({"group_id": group_id, "state": "hibernating", "by": "user"}),
    );
    assert!(!invalid.ok);
}
