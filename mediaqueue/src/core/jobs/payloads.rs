//! Strict enqueue request validation.
//!
//! Parameters are checked when a task enters the queue so a malformed request is
//! rejected up front instead of failing later inside a worker process.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{MediaJob, Task, UpscaleParams, VideoParams};
use crate::core::{QueueError, QueueResult};

const MAX_PATH_LEN: usize = 4096;
const SUPPORTED_SCALES: [u8; 3] = [2, 3, 4];
const SUPPORTED_INTERPOLATION_FACTORS: [u8; 3] = [2, 4, 8];
const MAX_FPS_OVERRIDE: f64 = 240.0;

fn invalid(msg: impl Into<String>) -> QueueError {
    QueueError::InvalidParameters(msg.into())
}

fn validate_path(label: &str, path: &std::path::Path) -> QueueResult<()> {
    let s = path.to_string_lossy();
    if s.trim().is_empty() {
        return Err(invalid(format!("{label} is empty")));
    }
    if s.len() > MAX_PATH_LEN {
        return Err(invalid(format!("{label} is too long (max {MAX_PATH_LEN} chars)")));
    }
    if s.chars().any(|c| c == '\0') {
        return Err(invalid(format!("{label} contains a NUL byte")));
    }
    let lower = s.to_ascii_lowercase();
    if lower.contains("://") {
        return Err(invalid(format!("{label} must be a local file path")));
    }
    Ok(())
}

fn validate_upscale(params: &UpscaleParams) -> QueueResult<()> {
    if !SUPPORTED_SCALES.contains(&params.scale) {
        return Err(invalid(format!(
            "scale must be one of {:?}, got {}",
            SUPPORTED_SCALES, params.scale
        )));
    }
    Ok(())
}

fn validate_video(params: &VideoParams) -> QueueResult<()> {
    validate_upscale(&params.upscale)?;
    if let Some(interpolation) = &params.interpolation {
        if !SUPPORTED_INTERPOLATION_FACTORS.contains(&interpolation.factor) {
            return Err(invalid(format!(
                "interpolation factor must be one of {:?}, got {}",
                SUPPORTED_INTERPOLATION_FACTORS, interpolation.factor
            )));
        }
    }
    if let Some(fps) = params.fps_override {
        if !fps.is_finite() || fps <= 0.0 || fps > MAX_FPS_OVERRIDE {
            return Err(invalid(format!(
                "fpsOverride must be a finite number in (0, {MAX_FPS_OVERRIDE}]"
            )));
        }
    }
    Ok(())
}

/// Validates kind-specific parameters.
pub fn validate_job(job: &MediaJob) -> QueueResult<()> {
    match job {
        MediaJob::Image(params) => validate_upscale(params),
        MediaJob::Video(params) => validate_video(params),
    }
}

// =============================================================================
// Enqueue Request
// =============================================================================

/// Everything a host supplies to queue a task
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EnqueueRequest {
    pub input_path: PathBuf,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    pub job: MediaJob,
    /// Also require the input file to exist at enqueue time
    #[serde(default)]
    pub require_existing_input: bool,
}

impl EnqueueRequest {
    pub fn image(input_path: impl Into<PathBuf>, params: UpscaleParams) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: None,
            job: MediaJob::Image(params),
            require_existing_input: false,
        }
    }

    pub fn video(input_path: impl Into<PathBuf>, params: VideoParams) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: None,
            job: MediaJob::Video(params),
            require_existing_input: false,
        }
    }

    pub fn with_output_path(mut self, output_path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(output_path.into());
        self
    }

    pub fn require_existing_input(mut self) -> Self {
        self.require_existing_input = true;
        self
    }

    pub fn validate(&self) -> QueueResult<()> {
        validate_path("inputPath", &self.input_path)?;
        if let Some(output) = &self.output_path {
            validate_path("outputPath", output)?;
            if output == &self.input_path {
                return Err(invalid("outputPath must differ from inputPath"));
            }
        }
        if self.require_existing_input {
            let meta = std::fs::metadata(&self.input_path).map_err(|_| {
                invalid(format!(
                    "inputPath file not found: {}",
                    self.input_path.display()
                ))
            })?;
            if !meta.is_file() {
                return Err(invalid(format!(
                    "inputPath is not a file: {}",
                    self.input_path.display()
                )));
            }
        }
        validate_job(&self.job)
    }

    /// Validates and turns the request into a fresh pending task.
    pub fn into_task(self) -> QueueResult<Task> {
        self.validate()?;
        let mut task = Task::new(self.input_path, self.job);
        task.output_path = self.output_path;
        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::jobs::{FrameInterpolation, TaskStatus};

    #[test]
    fn valid_image_request_becomes_pending_task() {
        let task = EnqueueRequest::image("/media/a.png", UpscaleParams::default())
            .into_task()
            .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.input_path, PathBuf::from("/media/a.png"));
    }

    #[test]
    fn rejects_unsupported_scale() {
        let req = EnqueueRequest::image(
            "/media/a.png",
            UpscaleParams {
                scale: 5,
                ..Default::default()
            },
        );
        assert!(matches!(
            req.validate(),
            Err(QueueError::InvalidParameters(_))
        ));
    }

    #[test]
    fn rejects_bad_video_parameters() {
        let bad_factor = EnqueueRequest::video(
            "/media/a.mp4",
            VideoParams {
                interpolation: Some(FrameInterpolation { factor: 3 }),
                ..Default::default()
            },
        );
        assert!(bad_factor.validate().is_err());

        let bad_fps = EnqueueRequest::video(
            "/media/a.mp4",
            VideoParams {
                fps_override: Some(f64::NAN),
                ..Default::default()
            },
        );
        assert!(bad_fps.validate().is_err());

        let ok = EnqueueRequest::video(
            "/media/a.mp4",
            VideoParams {
                interpolation: Some(FrameInterpolation { factor: 4 }),
                fps_override: Some(60.0),
                ..Default::default()
            },
        );
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_remote_paths() {
        assert!(EnqueueRequest::image("", UpscaleParams::default())
            .validate()
            .is_err());
        assert!(
            EnqueueRequest::image("https://example.com/a.png", UpscaleParams::default())
                .validate()
                .is_err()
        );
        assert!(EnqueueRequest::image("/media/a.png", UpscaleParams::default())
            .with_output_path("/media/a.png")
            .validate()
            .is_err());
    }

    #[test]
    fn existing_input_check_is_opt_in() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.png");

        assert!(EnqueueRequest::image(&missing, UpscaleParams::default())
            .validate()
            .is_ok());
        assert!(EnqueueRequest::image(&missing, UpscaleParams::default())
            .require_existing_input()
            .validate()
            .is_err());

        let present = dir.path().join("present.png");
        std::fs::write(&present, b"png").unwrap();
        assert!(EnqueueRequest::image(&present, UpscaleParams::default())
            .require_existing_input()
            .validate()
            .is_ok());
    }

    #[test]
    fn request_json_rejects_unknown_fields() {
        let json = r#"{
            "inputPath": "/media/a.png",
            "job": { "kind": "image", "parameters": { "scale": 2 } },
            "priority": "high"
        }"#;
        assert!(serde_json::from_str::<EnqueueRequest>(json).is_err());
    }
}
