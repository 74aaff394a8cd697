//! MediaQueue Error Definitions
//!
//! Defines error types used throughout the queue, orchestrator and worker.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use super::TaskId;

/// Core queue error types
#[derive(Error, Debug)]
pub enum QueueError {
    // =========================================================================
    // Coordination Errors
    // =========================================================================
    #[error("Could not acquire queue lock {} within {timeout:?}", path.display())]
    LockTimeout { path: PathBuf, timeout: Duration },

    #[error("Queue store corrupted: {0}")]
    StoreCorrupted(String),

    // =========================================================================
    // Task Errors
    // =========================================================================
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid task parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid task id: {0}")]
    InvalidTaskId(String),

    // =========================================================================
    // Worker Errors
    // =========================================================================
    #[error("Failed to spawn worker for task {task_id}: {reason}")]
    SpawnFailed { task_id: TaskId, reason: String },

    #[error("Processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Task cancelled")]
    Cancelled,

    // =========================================================================
    // General Errors
    // =========================================================================
    #[error("Settings error: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Core queue result type
pub type QueueResult<T> = Result<T, QueueError>;

impl QueueError {
    /// Coordination errors are recovered locally and never escalate to a crash.
    pub fn is_coordination(&self) -> bool {
        matches!(
            self,
            QueueError::LockTimeout { .. } | QueueError::StoreCorrupted(_)
        )
    }
}
