//! Tracing setup for applications embedding chatfork
//!
//! Logs go to `PathManager::log_file_path()` when it can be opened, and to
//! stderr otherwise. `RUST_LOG` overrides the default filter.

use std::path::PathBuf;
use std::sync::{Once, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::PathManager;

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_FILTER: &str = "info,chatfork_core=debug";

static INIT: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Install the global subscriber. Only the first call has any effect.
///
/// Returns the log file in use, or `None` when logging to stderr.
pub fn init_logging(default_filter: &str) -> Option<PathBuf> {
    let mut log_file = None;
    INIT.call_once(|| {
        log_file = init_file_logging(default_filter);
        if log_file.is_none() {
            init_stderr_logging(default_filter);
        }
    });
    log_file
}

fn init_file_logging(default_filter: &str) -> Option<PathBuf> {
    let path = PathManager::log_file_path()?;
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("[chatfork] Failed to create log directory {:?}: {}", parent, e);
            return None;
        }
    }

    let file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("[chatfork] Failed to open log file {:?}: {}", path, e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);
    // Keeps the background writer alive for the life of the process
    let _ = LOG_GUARD.set(guard);

    let subscriber = tracing_subscriber::registry().with(env_filter(default_filter)).with(
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .with_file(true)
            .with_line_number(true),
    );

    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => {
            tracing::info!("Logging initialized, writing to {:?}", path);
            Some(path)
        }
        Err(e) => {
            eprintln!("[chatfork] Failed to set tracing subscriber: {}", e);
            None
        }
    }
}

/// Log to stderr only; a no-op if a global subscriber is already set
pub fn init_stderr_logging(default_filter: &str) {
    let subscriber = tracing_subscriber::registry().with(env_filter(default_filter)).with(
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(true),
    );

    let _ = tracing::subscriber::set_global_default(subscriber);
}
