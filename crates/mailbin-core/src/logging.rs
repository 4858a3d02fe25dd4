use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::{Mutex, OnceLock};

use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MAILBIN_LOG";

static INIT: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber when `MAILBIN_LOG` is set. The variable is
/// an `EnvFilter` directive (`1` means `debug`). Output goes to
/// `$XDG_STATE_HOME/mailbin/mailbin.log`. Returns whether logging is active.
pub fn init() -> bool {
    *INIT.get_or_init(|| {
        let Ok(directive) = std::env::var(LOG_ENV) else {
            return false;
        };
        let directive = match directive.trim() {
            "" | "1" | "true" => "debug".to_string(),
            other => other.to_string(),
        };
        let path = log_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
            return false;
        };
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .with_target(false)
            .with_writer(Mutex::new(file))
            .try_init()
            .is_ok()
    })
}

pub fn log_path() -> PathBuf {
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    base.join("mailbin").join("mailbin.log")
}
