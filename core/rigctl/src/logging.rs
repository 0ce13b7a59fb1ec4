//! Logging setup for rigctl.
//!
//! Human-readable events go to stderr; the same events are appended to a
//! daily file under `~/.neurorig/logs/` so operator actions can be audited
//! after the fact. The returned guard must live until exit or buffered file
//! lines are lost.

use std::env;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "RIGCTL_LOG";
const DEBUG_ENV_VAR: &str = "RIGCTL_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "rigctl.log";

pub fn init() -> Option<WorkerGuard> {
    let filter = build_filter();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = match log_dir().and_then(|dir| {
        fs_err::create_dir_all(&dir).ok()?;
        Some(dir)
    }) {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(UtcTime::rfc_3339());
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .try_init();
    if installed.is_err() {
        return None;
    }
    guard
}

fn build_filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV_VAR)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn log_dir() -> Option<PathBuf> {
    neurorig_core::config::data_dir().map(|dir| dir.join("logs"))
}
