//! MediaQueue worker process.
//!
//! Runs exactly one attempt of one queued task:
//!
//! ```text
//! mediaqueue-worker <task_id> <queue_dir> [--debug]
//! ```
//!
//! Everything else (parameters, progress, result) flows through the queue directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use mediaqueue::core::processor::CommandProcessor;
use mediaqueue::core::settings::SettingsManager;
use mediaqueue::core::worker::TaskWorker;

#[derive(Parser, Debug)]
#[command(
    name = "mediaqueue-worker",
    version,
    about = "Runs one media enhancement task from a queue directory"
)]
struct Args {
    /// Task to run
    task_id: String,

    /// Queue directory holding queue.json
    queue_dir: PathBuf,

    /// Verbose logging (also enabled by MEDIAQUEUE_DEBUG=1)
    #[arg(long)]
    debug: bool,
}

/// Resolves on the next Ctrl-C or SIGTERM.
async fn termination_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = sigterm.recv() => Ok(()),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

/// First signal requests a cooperative stop; a second one exits immediately.
fn watch_signals(cancelled: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if let Err(e) = termination_signal().await {
            warn!("Signal handling unavailable: {}", e);
            return;
        }
        info!("Termination requested; stopping at the next checkpoint");
        cancelled.store(true, Ordering::SeqCst);

        if termination_signal().await.is_ok() {
            warn!("Second termination request; exiting without cleanup");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    let debug = args.debug || mediaqueue::debug_from_env();
    mediaqueue::init_logging(
        &args.queue_dir.join(mediaqueue::LOG_DIR_NAME),
        "worker.log",
        debug,
    );

    let settings = SettingsManager::new(&args.queue_dir).load();
    let worker = TaskWorker::new(&args.task_id, &args.queue_dir, &settings)
        .with_context(|| format!("cannot open task {}", args.task_id))?;
    watch_signals(worker.cancel_flag());

    let span = tracing::info_span!("worker", task_id = %args.task_id, pid = std::process::id());
    let outcome = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        match CommandProcessor::from_settings(&settings.processor) {
            Ok(mut processor) => worker.run(&mut processor),
            Err(e) => {
                error!("{}", e);
                worker.fail(e.to_string())
            }
        }
    })
    .await
    .context("worker thread panicked")?;

    info!(task_id = %args.task_id, outcome = ?outcome, "Worker finished");
    Ok(ExitCode::from(outcome.exit_code() as u8))
}
