//! cccc-bridge: one process proxying one group's ledger to one IM platform.

mod adapters;
mod bridge;
mod commands;
mod subscribers;

use std::process::ExitCode;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use serde_json::Value;
use tracing::error;

use adapters::discord::DiscordAdapter;
use adapters::slack::SlackAdapter;
use adapters::telegram::TelegramAdapter;
use adapters::{ConsoleAdapter, ImAdapter};
use bridge::Bridge;

#[derive(Parser, Debug)]
#[command(name = "cccc-bridge", version, about = "CCCC IM bridge")]
struct Cli {
    /// Group to bridge.
    #[arg(long = "group")]
    group_id: String,
    /// Platform adapter: telegram or console.
    #[arg(long, default_value = "telegram")]
    platform: String,
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

fn is_env_var_name(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Resolve a token from the group's IM config: the config names an env var,
/// but a literal token pasted into the field is tolerated (a common
/// misconfiguration).
fn resolve_token(im: &Value, env_keys: &[&str], literal_keys: &[&str]) -> Option<String> {
    for key in env_keys {
        let raw = im[*key].as_str().unwrap_or("").trim();
        if raw.is_empty() {
            continue;
        }
        if is_env_var_name(raw) {
            if let Ok(token) = std::env::var(raw) {
                let token = token.trim().to_string();
                if !token.is_empty() {
                    return Some(token);
                }
            }
        } else {
            return Some(raw.to_string());
        }
    }
    for key in literal_keys {
        let raw = im[*key].as_str().unwrap_or("").trim();
        if !raw.is_empty() {
            return Some(raw.to_string());
        }
    }
    None
}

static STOP: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn handle_signal(_sig: libc::c_int) {
    if let Some(stop) = STOP.get() {
        stop.store(false, Ordering::SeqCst);
    }
}

fn install_signal_handlers(stop: Arc<AtomicBool>) {
    let _ = STOP.set(stop);
    unsafe {
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
    }
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let home = match cccc_core::paths::ensure_home() {
        Ok(home) => home,
        Err(e) => {
            error!(err = %e, "failed to create CCCC home");
            return ExitCode::from(1);
        }
    };
    let Some(group) = cccc_core::group::load_group(&home, &cli.group_id) else {
        error!(group_id = %cli.group_id, "group not found");
        return ExitCode::from(1);
    };

    let platform = cli.platform.to_lowercase();
    let im = &group.doc.im;
    let configured = im["platform"].as_str().unwrap_or("").to_lowercase();
    if !configured.is_empty() && configured != platform {
        error!("group is configured for {configured}, not {platform}");
        return ExitCode::from(1);
    }

    let adapter: Arc<dyn ImAdapter> = match platform.as_str() {
        "telegram" => {
            let Some(token) = resolve_token(im, &["token_env", "bot_token_env"], &["token"]) else {
                error!("no telegram token configured (set token_env in the group's im config)");
                return ExitCode::from(1);
            };
            Arc::new(TelegramAdapter::new(token))
        }
        "slack" => {
            let Some(token) = resolve_token(im, &["bot_token_env", "token_env"], &["bot_token", "token"])
            else {
                error!("no slack bot token configured (set bot_token_env in the group's im config)");
                return ExitCode::from(1);
            };
            Arc::new(SlackAdapter::new(token))
        }
        "discord" => {
            let Some(token) = resolve_token(im, &["token_env", "bot_token_env"], &["token"]) else {
                error!("no discord token configured (set token_env in the group's im config)");
                return ExitCode::from(1);
            };
            Arc::new(DiscordAdapter::new(token))
        }
        "console" => Arc::new(ConsoleAdapter::default()),
        other => {
            error!("unsupported platform: {other}");
            return ExitCode::from(1);
        }
    };

    // Singleton: exactly one bridge per group. The lock is held for the
    // process lifetime and released by the OS on exit.
    let lock_path = group.state_dir().join("im_bridge.lock");
    let _lock = match cccc_core::lock::try_acquire_exclusive(&lock_path) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            error!("another bridge instance is already running for this group");
            return ExitCode::from(1);
        }
        Err(e) => {
            error!(err = %e, "failed to acquire bridge lock");
            return ExitCode::from(1);
        }
    };
    let _ = cccc_core::fsutil::atomic_write_text(
        &group.state_dir().join("im_bridge.pid"),
        &format!("{}\n", std::process::id()),
    );

    let mut bridge = Bridge::new(home, &group, adapter);
    install_signal_handlers(bridge.stop_handle());

    match bridge.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(err = %e, "bridge failed");
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_names_are_recognized() {
        assert!(is_env_var_name("TELEGRAM_BOT_TOKEN"));
        assert!(is_env_var_name("_PRIVATE"));
        assert!(!is_env_var_name("123ABC"));
        assert!(!is_env_var_name("lower_case"));
        assert!(!is_env_var_name("1234:literal-token"));
        assert!(!is_env_var_name(""));
    }

    #[test]
    fn literal_token_in_env_field_is_tolerated() {
        let im = serde_json::json!({"token_env": "1234:abcdef-raw-token"});
        let token = resolve_token(&im, &["token_env"], &["token"]);
        assert_eq!(token.as_deref(), Some("1234:abcdef-raw-token"));
    }

    #[test]
    fn env_var_indirection_resolves() {
        unsafe { std::env::set_var("CCCC_TEST_BRIDGE_TOKEN", "tok-123") };
        let im = serde_json::json!({"token_env": "CCCC_TEST_BRIDGE_TOKEN"});
        let token = resolve_token(&im, &["token_env"], &[]);
        assert_eq!(token.as_deref(), Some("tok-123"));
        unsafe { std::env::remove_var("CCCC_TEST_BRIDGE_TOKEN") };
    }

    #[test]
    fn missing_token_yields_none() {
        let im = serde_json::json!({});
        assert!(resolve_token(&im, &["token_env"], &["token"]).is_none());
    }
}
