//! MediaQueue Core Library
//!
//! Durable, crash-recoverable job queue for long-running media enhancement
//! (upscaling, face restoration, frame interpolation). Jobs run in separate worker
//! processes, coordinated only through files in a queue directory:
//!
//! - `queue.json` + `queue.lock`: the task store, guarded by an advisory lock
//! - `progress_<task_id>.json`: progress sidecars written by workers
//! - `cancel_<task_id>.signal`: cooperative cancellation markers
//!
//! Hosts embed a [`core::orchestrator::Orchestrator`]; the `mediaqueue-worker`
//! binary runs one task per process.

pub mod core;

use std::path::Path;
use std::sync::OnceLock;

/// Subdirectory of the queue directory holding worker logs
pub const LOG_DIR_NAME: &str = "logs";

/// Environment variable that switches on debug logging
pub const DEBUG_ENV_VAR: &str = "MEDIAQUEUE_DEBUG";

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Whether `MEDIAQUEUE_DEBUG` asks for debug logging (`1`, `true` or `yes`).
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV_VAR)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Installs the global subscriber: stderr plus a daily-rolling file in `log_dir`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(log_dir: &Path, file_name: &str, debug: bool) {
    let _ = std::fs::create_dir_all(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if LOG_GUARD.set(guard).is_err() {
        return;
    }

    use tracing_subscriber::prelude::*;

    let level = if debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let env_filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

    // Stdout is reserved for command output (`list --json`).
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer);

    // Avoid panics if already initialized (tests).
    let _ = tracing::subscriber::set_global_default(subscriber);
}
