//! Task Model Module
//!
//! Defines the queued unit of work, its lifecycle states and the per-kind
//! enhancement parameters handed to the processing routine.

mod payloads;

pub use payloads::*;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{clamp_progress, new_task_id, OwnerId, TaskId};

// =============================================================================
// Task Status
// =============================================================================

/// Task lifecycle state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed
    #[default]
    Pending,
    /// Claimed by an orchestrator and handed to a worker
    Processing,
    /// Worker is fetching model weights before processing
    DownloadingModels,
    /// Held back by a queue pause
    Paused,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Stopped by the user
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed or cancelled
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// A worker currently owns the task
    pub fn is_active(self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::DownloadingModels)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::DownloadingModels => "downloading_models",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Parameters
// =============================================================================

/// Media kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaKind::Image => f.write_str("image"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Upscaling model family
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpscaleModel {
    /// Photographic content
    #[default]
    General,
    /// Illustrations and animation
    Anime,
}

impl std::fmt::Display for UpscaleModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpscaleModel::General => f.write_str("general"),
            UpscaleModel::Anime => f.write_str("anime"),
        }
    }
}

/// Parameters shared by image and video enhancement
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpscaleParams {
    pub scale: u8,
    #[serde(default)]
    pub face_enhance: bool,
    #[serde(default)]
    pub model: UpscaleModel,
    #[serde(default = "default_true")]
    pub preserve_metadata: bool,
    #[serde(default)]
    pub replace_original: bool,
}

fn default_true() -> bool {
    true
}

impl Default for UpscaleParams {
    fn default() -> Self {
        Self {
            scale: 2,
            face_enhance: false,
            model: UpscaleModel::General,
            preserve_metadata: true,
            replace_original: false,
        }
    }
}

/// Frame interpolation request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInterpolation {
    pub factor: u8,
}

/// Video-only parameters
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoParams {
    pub upscale: UpscaleParams,
    #[serde(default)]
    pub interpolation: Option<FrameInterpolation>,
    #[serde(default)]
    pub fps_override: Option<f64>,
}

/// Kind-specific job description, opaque to the scheduler
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "parameters", rename_all = "lowercase")]
pub enum MediaJob {
    Image(UpscaleParams),
    Video(VideoParams),
}

impl MediaJob {
    pub fn kind(&self) -> MediaKind {
        match self {
            MediaJob::Image(_) => MediaKind::Image,
            MediaJob::Video(_) => MediaKind::Video,
        }
    }

    pub fn upscale(&self) -> &UpscaleParams {
        match self {
            MediaJob::Image(params) => params,
            MediaJob::Video(params) => &params.upscale,
        }
    }

    pub fn interpolation(&self) -> Option<&FrameInterpolation> {
        match self {
            MediaJob::Image(_) => None,
            MediaJob::Video(params) => params.interpolation.as_ref(),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Queued enhancement task
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task ID
    pub id: TaskId,
    /// Source media file
    pub input_path: PathBuf,
    /// Resolved by the worker when not given at enqueue time
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// What to do with the media
    pub job: MediaJob,
    /// Current status
    #[serde(default)]
    pub status: TaskStatus,
    /// Progress percentage in `[0, 100]`
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// Set when an orchestrator claims the task
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Orchestrator instance holding the claim
    #[serde(default)]
    pub owner_id: Option<OwnerId>,
    /// Best-effort worker pid; never authoritative
    #[serde(default)]
    pub process_id: Option<u32>,
}

impl Task {
    /// Creates a pending task
    pub fn new(input_path: impl Into<PathBuf>, job: MediaJob) -> Self {
        let now = Utc::now();
        Self {
            id: new_task_id(),
            input_path: input_path.into(),
            output_path: None,
            job,
            status: TaskStatus::Pending,
            progress: 0.0,
            error_message: None,
            created_at: now,
            last_updated: now,
            claimed_at: None,
            owner_id: None,
            process_id: None,
        }
    }

    pub fn with_output_path(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(output_path.into());
        self
    }

    pub fn kind(&self) -> MediaKind {
        self.job.kind()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Applies a status change and bumps `last_updated`.
    pub fn set_status(&mut self, status: TaskStatus, now: DateTime<Utc>) {
        self.status = status;
        self.last_updated = now;
    }

    pub fn set_progress(&mut self, progress: f64, now: DateTime<Utc>) {
        self.progress = clamp_progress(progress);
        self.last_updated = now;
    }

    /// Marks the task as claimed by `owner`.
    pub fn claim(&mut self, owner: &str, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.owner_id = Some(owner.to_string());
        self.claimed_at = Some(now);
        self.error_message = None;
        self.last_updated = now;
    }

    /// Drops the claim and makes the task eligible for a fresh attempt.
    pub fn release_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.progress = 0.0;
        self.claimed_at = None;
        self.owner_id = None;
        self.process_id = None;
        self.last_updated = now;
    }

    /// Output location the worker should write to when none was given.
    pub fn default_output_path(&self) -> PathBuf {
        default_output_path(&self.input_path, self.job.upscale().scale)
    }
}

/// `<dir>/<stem>_upscaled_<scale>x<ext>`
pub fn default_output_path(input: &Path, scale: u8) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string());
    let file_name = match input.extension() {
        Some(ext) => format!("{stem}_upscaled_{scale}x.{}", ext.to_string_lossy()),
        None => format!("{stem}_upscaled_{scale}x"),
    };
    input.with_file_name(file_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_job() -> MediaJob {
        MediaJob::Image(UpscaleParams::default())
    }

    #[test]
    fn test_task_creation() {
        let task = Task::new("/media/photo.png", image_job());

        assert!(task.id.starts_with("task_"));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.kind(), MediaKind::Image);
        assert_eq!(task.progress, 0.0);
        assert!(task.output_path.is_none());
        assert!(task.claimed_at.is_none());
        assert!(task.owner_id.is_none());
    }

    #[test]
    fn test_status_classification() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());

        assert!(TaskStatus::Processing.is_active());
        assert!(TaskStatus::DownloadingModels.is_active());
        assert!(!TaskStatus::Pending.is_active());
    }

    #[test]
    fn test_status_wire_names() {
        let json = serde_json::to_string(&TaskStatus::DownloadingModels).unwrap();
        assert_eq!(json, "\"downloading_models\"");
        let status: TaskStatus = serde_json::from_str("\"cancelled\"").unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
    }

    #[test]
    fn test_claim_and_release() {
        let mut task = Task::new("/media/clip.mp4", MediaJob::Video(VideoParams::default()));
        let now = Utc::now();

        task.claim("owner-a", now);
        assert_eq!(task.status, TaskStatus::Processing);
        assert_eq!(task.owner_id.as_deref(), Some("owner-a"));
        assert_eq!(task.claimed_at, Some(now));

        task.process_id = Some(4242);
        task.set_progress(37.0, now);
        task.release_to_pending(now);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0.0);
        assert!(task.claimed_at.is_none());
        assert!(task.owner_id.is_none());
        assert!(task.process_id.is_none());
    }

    #[test]
    fn test_job_serialization_is_tagged_by_kind() {
        let job = MediaJob::Video(VideoParams {
            upscale: UpscaleParams {
                scale: 4,
                ..Default::default()
            },
            interpolation: Some(FrameInterpolation { factor: 2 }),
            fps_override: None,
        });
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["kind"], "video");
        assert_eq!(value["parameters"]["upscale"]["scale"], 4);
        assert_eq!(value["parameters"]["interpolation"]["factor"], 2);

        let back: MediaJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn test_default_output_path() {
        assert_eq!(
            default_output_path(Path::new("/media/photo.png"), 2),
            PathBuf::from("/media/photo_upscaled_2x.png")
        );
        assert_eq!(
            default_output_path(Path::new("/media/raw"), 4),
            PathBuf::from("/media/raw_upscaled_4x")
        );
    }
}
