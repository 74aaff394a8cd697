//! Worker Process Lifecycle
//!
//! One worker process runs exactly one attempt of one task. It reads its task from
//! the queue store, re-affirms the claim, streams progress through its sidecar
//! file, and writes the final status back to the store itself.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::core::jobs::{Task, TaskStatus};
use crate::core::processor::{MediaProcessor, ProcessOutcome, ProcessRequest, ProgressControl, ProgressReporter};
use crate::core::queue::{QueueFile, QueueStore, TaskFiles};
use crate::core::settings::QueueSettings;
use crate::core::{clamp_progress, QueueError, QueueResult, TaskId};

// =============================================================================
// Outcome
// =============================================================================

/// How a worker run ended
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerOutcome {
    Completed { output_path: PathBuf },
    Cancelled,
    Failed { message: String },
    /// The task was missing, finished or no longer ours; nothing was written
    Skipped { reason: String },
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerOutcome::Completed { .. } => 0,
            _ => 1,
        }
    }

    fn status(&self) -> Option<TaskStatus> {
        match self {
            WorkerOutcome::Completed { .. } => Some(TaskStatus::Completed),
            WorkerOutcome::Cancelled => Some(TaskStatus::Cancelled),
            WorkerOutcome::Failed { .. } => Some(TaskStatus::Failed),
            WorkerOutcome::Skipped { .. } => None,
        }
    }
}

// =============================================================================
// Progress Reporter
// =============================================================================

/// Progress callback backed by the task's sidecar and cancel signal.
struct SidecarReporter<'a> {
    files: &'a TaskFiles,
    cancelled: &'a AtomicBool,
    last: Option<(f64, TaskStatus)>,
    stop_requested: bool,
}

impl<'a> SidecarReporter<'a> {
    fn new(files: &'a TaskFiles, cancelled: &'a AtomicBool) -> Self {
        Self {
            files,
            cancelled,
            last: None,
            stop_requested: false,
        }
    }

    fn check_cancel(&mut self) -> bool {
        if self.cancelled.load(Ordering::SeqCst) || self.files.cancel_requested() {
            self.stop_requested = true;
        }
        self.stop_requested
    }

    fn publish(&mut self, progress: f64, status: TaskStatus) -> ProgressControl {
        if self.check_cancel() {
            return ProgressControl::Stop;
        }
        let progress = clamp_progress(progress);
        if self.last != Some((progress, status)) {
            match self.files.write_progress(progress, Some(status)) {
                Ok(_) => self.last = Some((progress, status)),
                Err(e) => warn!(task_id = %self.files.task_id(), "Failed to write progress: {}", e),
            }
        }
        ProgressControl::Continue
    }
}

impl ProgressReporter for SidecarReporter<'_> {
    fn report(&mut self, percent: f64) -> ProgressControl {
        self.publish(percent, TaskStatus::Processing)
    }

    fn downloading_models(&mut self) -> ProgressControl {
        let progress = self.last.map(|(p, _)| p).unwrap_or(0.0);
        self.publish(progress, TaskStatus::DownloadingModels)
    }
}

// =============================================================================
// Task Worker
// =============================================================================

/// Runs a single claimed task
pub struct TaskWorker {
    task_id: TaskId,
    store: QueueStore,
    files: TaskFiles,
    cancelled: Arc<AtomicBool>,
}

impl TaskWorker {
    pub fn new(task_id: &str, queue_dir: &Path, settings: &QueueSettings) -> QueueResult<Self> {
        let files = TaskFiles::new(queue_dir, task_id)?;
        Ok(Self {
            task_id: task_id.to_string(),
            store: QueueStore::open(queue_dir, settings)?,
            files,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Flag a termination signal handler sets to request a cooperative stop.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn cancel_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst) || self.files.cancel_requested()
    }

    /// Executes the task once and records the result in the queue store.
    pub fn run(&self, processor: &mut dyn MediaProcessor) -> WorkerOutcome {
        let (task, claim) = match self.reaffirm() {
            Ok(Ok(pair)) => pair,
            Ok(Err(reason)) => {
                info!(task_id = %self.task_id, "Nothing to do: {}", reason);
                return WorkerOutcome::Skipped { reason };
            }
            Err(e) => {
                error!(task_id = %self.task_id, "Failed to load task: {}", e);
                return WorkerOutcome::Skipped {
                    reason: format!("queue store unavailable: {e}"),
                };
            }
        };

        if self.cancel_requested() {
            info!(task_id = %self.task_id, "Cancelled before start");
            return self.finish(WorkerOutcome::Cancelled, claim);
        }

        if let Err(e) = self.files.write_progress(0.0, Some(TaskStatus::Processing)) {
            warn!(task_id = %self.task_id, "Failed to create progress file: {}", e);
        }

        let output = task
            .output_path
            .clone()
            .unwrap_or_else(|| task.default_output_path());
        let request = ProcessRequest {
            task_id: task.id.clone(),
            input: task.input_path.clone(),
            output,
            job: task.job.clone(),
        };
        info!(
            task_id = %self.task_id,
            kind = %task.kind(),
            input = %request.input.display(),
            output = %request.output.display(),
            "Processing started"
        );

        let mut reporter = SidecarReporter::new(&self.files, &self.cancelled);
        let result = catch_unwind(AssertUnwindSafe(|| processor.process(&request, &mut reporter)));
        let stop_requested = reporter.stop_requested;

        let outcome = match result {
            Ok(Ok(ProcessOutcome::Completed { output_path })) => {
                match self.finalize_output(&task, output_path) {
                    Ok(output_path) => WorkerOutcome::Completed { output_path },
                    Err(e) => WorkerOutcome::Failed {
                        message: e.to_string(),
                    },
                }
            }
            Ok(Ok(ProcessOutcome::Stopped)) | Ok(Err(QueueError::Cancelled)) => {
                WorkerOutcome::Cancelled
            }
            Ok(Err(e)) if stop_requested || self.cancel_requested() => {
                debug!(task_id = %self.task_id, "Processor error after cancel: {}", e);
                WorkerOutcome::Cancelled
            }
            Ok(Err(e)) => WorkerOutcome::Failed {
                message: e.to_string(),
            },
            Err(payload) => WorkerOutcome::Failed {
                message: format!("processor panicked: {}", panic_message(payload.as_ref())),
            },
        };

        self.finish(outcome, claim)
    }

    /// Records a failure that happened before processing could start.
    pub fn fail(&self, message: impl Into<String>) -> WorkerOutcome {
        let claim = match self.store.load() {
            Ok(file) => file.tasks.get(&self.task_id).and_then(|t| t.claimed_at),
            Err(e) => {
                error!(task_id = %self.task_id, "Failed to load task: {}", e);
                None
            }
        };
        self.finish(
            WorkerOutcome::Failed {
                message: message.into(),
            },
            claim,
        )
    }

    /// Re-asserts `processing` and records this process's pid.
    ///
    /// The inner `Err` carries a reason the task must not run.
    fn reaffirm(&self) -> QueueResult<Result<(Task, Option<DateTime<Utc>>), String>> {
        let pid = std::process::id();
        self.store.update(|file| {
            let Some(task) = file.tasks.get_mut(&self.task_id) else {
                return Err("task not found".to_string());
            };
            if task.is_terminal() {
                return Err(format!("task is already {}", task.status));
            }
            if !task.is_active() {
                return Err(format!("task is {} and not claimed", task.status));
            }
            let now = Utc::now();
            task.status = TaskStatus::Processing;
            task.process_id = Some(pid);
            task.last_updated = now;
            Ok((task.clone(), task.claimed_at))
        })
    }

    fn finalize_output(&self, task: &Task, output_path: PathBuf) -> QueueResult<PathBuf> {
        if !task.job.upscale().replace_original || output_path == task.input_path {
            return Ok(output_path);
        }
        std::fs::rename(&output_path, &task.input_path)?;
        Ok(task.input_path.clone())
    }

    /// Writes the terminal status, unless the claim changed hands meanwhile.
    fn finish(&self, outcome: WorkerOutcome, claim: Option<DateTime<Utc>>) -> WorkerOutcome {
        if let Some(status) = outcome.status() {
            let written = self.update_final(|file| {
                let Some(task) = file.tasks.get_mut(&self.task_id) else {
                    return false;
                };
                if !task.is_active() || task.claimed_at != claim {
                    return false;
                }
                let now = Utc::now();
                match &outcome {
                    WorkerOutcome::Completed { output_path } => {
                        task.output_path = Some(output_path.clone());
                        task.set_progress(100.0, now);
                        task.error_message = None;
                    }
                    WorkerOutcome::Failed { message } => {
                        task.error_message = Some(message.clone());
                    }
                    _ => {}
                }
                task.set_status(status, now);
                true
            });

            match written {
                Ok(true) => match &outcome {
                    WorkerOutcome::Failed { message } => {
                        error!(task_id = %self.task_id, "Task failed: {}", message)
                    }
                    _ => info!(task_id = %self.task_id, "Task {}", status),
                },
                Ok(false) => warn!(
                    task_id = %self.task_id,
                    "Task was removed or reclaimed; dropping {} result",
                    status
                ),
                Err(e) => error!(task_id = %self.task_id, "Failed to record {}: {}", status, e),
            }

            if let Err(e) = self.files.remove_progress() {
                warn!(task_id = %self.task_id, "Failed to remove progress file: {}", e);
            }
        }
        outcome
    }
}

/// Attempts at the final status write before the result is given up.
const FINAL_WRITE_ATTEMPTS: u32 = 3;

impl TaskWorker {
    /// Store update that retries lock timeouts, so a finished result is not lost to contention.
    fn update_final<T>(&self, mut mutate: impl FnMut(&mut QueueFile) -> T) -> QueueResult<T> {
        let mut attempt = 1;
        loop {
            match self.store.update(&mut mutate) {
                Err(e @ QueueError::LockTimeout { .. }) if attempt < FINAL_WRITE_ATTEMPTS => {
                    warn!(
                        task_id = %self.task_id,
                        attempt,
                        "Final status write delayed: {}",
                        e
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

/// Extracts the message of a panic payload.
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
