//! Per-task side files.
//!
//! - `progress_<task_id>.json`: written only by the task's worker, read by the orchestrator.
//! - `cancel_<task_id>.signal`: presence-only marker created by the orchestrator.
//!
//! Each file has exactly one writer, so neither takes the queue lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fs::{atomic_write_json_pretty, remove_if_exists, validate_path_id_component};
use crate::core::jobs::TaskStatus;
use crate::core::{clamp_progress, QueueResult, TaskId};

const PROGRESS_PREFIX: &str = "progress_";
const PROGRESS_SUFFIX: &str = ".json";
const CANCEL_PREFIX: &str = "cancel_";
const CANCEL_SUFFIX: &str = ".signal";

/// Content of a progress sidecar
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub task_id: TaskId,
    pub progress: f64,
    #[serde(default)]
    pub status: Option<TaskStatus>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(task_id: &str, progress: f64, status: Option<TaskStatus>) -> Self {
        Self {
            task_id: task_id.to_string(),
            progress: clamp_progress(progress),
            status,
            timestamp: Utc::now(),
        }
    }
}

/// Paths of the side files belonging to one task
#[derive(Clone, Debug)]
pub struct TaskFiles {
    task_id: TaskId,
    progress_path: PathBuf,
    cancel_path: PathBuf,
}

impl TaskFiles {
    pub fn new(queue_dir: &Path, task_id: &str) -> QueueResult<Self> {
        validate_path_id_component(task_id, "taskId")?;
        Ok(Self {
            task_id: task_id.to_string(),
            progress_path: queue_dir.join(format!("{PROGRESS_PREFIX}{task_id}{PROGRESS_SUFFIX}")),
            cancel_path: queue_dir.join(format!("{CANCEL_PREFIX}{task_id}{CANCEL_SUFFIX}")),
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn progress_path(&self) -> &Path {
        &self.progress_path
    }

    pub fn cancel_path(&self) -> &Path {
        &self.cancel_path
    }

    pub fn write_progress(&self, progress: f64, status: Option<TaskStatus>) -> QueueResult<ProgressRecord> {
        let record = ProgressRecord::new(&self.task_id, progress, status);
        atomic_write_json_pretty(&self.progress_path, &record)?;
        Ok(record)
    }

    pub fn read_progress(&self) -> QueueResult<Option<ProgressRecord>> {
        read_progress_file(&self.progress_path)
    }

    pub fn remove_progress(&self) -> std::io::Result<bool> {
        remove_if_exists(&self.progress_path)
    }

    pub fn request_cancel(&self) -> std::io::Result<()> {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.cancel_path)
            .map(|_| ())
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_path.exists()
    }

    pub fn remove_cancel(&self) -> std::io::Result<bool> {
        remove_if_exists(&self.cancel_path)
    }

    /// Deletes both side files, logging rather than failing.
    pub fn cleanup(&self) {
        if let Err(e) = self.remove_progress() {
            tracing::error!("Failed to clean up {}: {}", self.progress_path.display(), e);
        }
        if let Err(e) = self.remove_cancel() {
            tracing::error!("Failed to clean up {}: {}", self.cancel_path.display(), e);
        }
    }
}

/// Reads a sidecar; a file that vanished between listing and reading is `None`.
pub fn read_progress_file(path: &Path) -> QueueResult<Option<ProgressRecord>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn scan(queue_dir: &Path, prefix: &str, suffix: &str) -> QueueResult<Vec<(TaskId, PathBuf)>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(queue_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let Some(id) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if validate_path_id_component(id, "taskId").is_err() {
            continue;
        }
        found.push((id.to_string(), entry.path()));
    }
    found.sort();
    Ok(found)
}

/// Lists `(task_id, path)` for every progress sidecar in the queue directory.
pub fn scan_progress_files(queue_dir: &Path) -> QueueResult<Vec<(TaskId, PathBuf)>> {
    scan(queue_dir, PROGRESS_PREFIX, PROGRESS_SUFFIX)
}

/// Lists `(task_id, path)` for every cancel signal in the queue directory.
pub fn scan_cancel_signals(queue_dir: &Path) -> QueueResult<Vec<(TaskId, PathBuf)>> {
    scan(queue_dir, CANCEL_PREFIX, CANCEL_SUFFIX)
}
