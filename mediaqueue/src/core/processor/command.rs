//! External tool bridge.
//!
//! Runs a configured enhancement executable once per stage, substituting task
//! parameters into an argument template and reading `key=value` progress lines
//! from its stdout:
//!
//! ```text
//! progress=42.5
//! status=downloading_models
//! ```

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{MediaProcessor, ProcessOutcome, ProcessRequest, ProgressControl, ProgressReporter, StageProgress};
use crate::core::jobs::MediaJob;
use crate::core::process::configure_std_command;
use crate::core::settings::ProcessorSettings;
use crate::core::{QueueError, QueueResult};

/// How often the callback is consulted while the tool is silent
const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(500);

/// Pass of the external tool
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Upscale,
    Interpolate,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Upscale => "upscale",
            Stage::Interpolate => "interpolate",
        }
    }
}

/// Stages a job needs, in execution order.
pub fn stages_for(job: &MediaJob) -> Vec<Stage> {
    match job.interpolation() {
        Some(_) => vec![Stage::Upscale, Stage::Interpolate],
        None => vec![Stage::Upscale],
    }
}

/// A parsed stdout line from the tool
#[derive(Clone, Debug, PartialEq)]
enum ToolLine {
    Progress(f64),
    DownloadingModels,
    Other,
}

fn parse_tool_line(line: &str) -> ToolLine {
    let line = line.trim();
    if let Some(value) = line.strip_prefix("progress=") {
        return match value.trim().trim_end_matches('%').parse::<f64>() {
            Ok(p) if p.is_finite() => ToolLine::Progress(p),
            _ => ToolLine::Other,
        };
    }
    if let Some(value) = line.strip_prefix("status=") {
        if value.trim() == "downloading_models" {
            return ToolLine::DownloadingModels;
        }
    }
    ToolLine::Other
}

/// Invokes an external executable for each stage of a job.
///
/// Argument placeholders: `{input}`, `{output}`, `{stage}`, `{kind}`, `{scale}`,
/// `{model}`, `{face_enhance}`, `{preserve_metadata}`, `{interpolation_factor}`
/// (`1` when not interpolating) and `{fps}` (`0` keeps the source rate).
#[derive(Clone, Debug)]
pub struct CommandProcessor {
    program: PathBuf,
    args: Vec<String>,
    heartbeat: Duration,
}

impl CommandProcessor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }

    pub fn from_settings(settings: &ProcessorSettings) -> QueueResult<Self> {
        let program = settings.program.clone().ok_or_else(|| {
            QueueError::Settings("no enhancement tool configured (processor.program)".to_string())
        })?;
        Ok(Self::new(program, settings.args.clone()))
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Renders the argument template for one stage.
    pub fn render_args(&self, job: &MediaJob, stage: Stage, input: &Path, output: &Path) -> Vec<String> {
        let upscale = job.upscale();
        let interpolation_factor = job.interpolation().map(|i| i.factor).unwrap_or(1);
        let fps = match job {
            MediaJob::Video(params) => params.fps_override.unwrap_or(0.0),
            MediaJob::Image(_) => 0.0,
        };

        let replacements = [
            ("{input}", input.to_string_lossy().to_string()),
            ("{output}", output.to_string_lossy().to_string()),
            ("{stage}", stage.as_str().to_string()),
            ("{kind}", job.kind().to_string()),
            ("{scale}", upscale.scale.to_string()),
            ("{model}", upscale.model.to_string()),
            ("{face_enhance}", upscale.face_enhance.to_string()),
            ("{preserve_metadata}", upscale.preserve_metadata.to_string()),
            ("{interpolation_factor}", interpolation_factor.to_string()),
            ("{fps}", fps.to_string()),
        ];

        self.args
            .iter()
            .map(|arg| {
                replacements
                    .iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect()
    }

    fn spawn(&self, args: &[String]) -> QueueResult<Child> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        configure_std_command(&mut cmd);
        cmd.spawn().map_err(|e| {
            QueueError::ProcessingFailed(format!(
                "failed to start {}: {}",
                self.program.display(),
                e
            ))
        })
    }

    /// Runs one stage; returns `false` when the callback stopped it.
    fn run_stage(
        &self,
        request: &ProcessRequest,
        stage: Stage,
        input: &Path,
        output: &Path,
        progress: &mut dyn ProgressReporter,
    ) -> QueueResult<bool> {
        let args = self.render_args(&request.job, stage, input, output);
        info!(
            task_id = %request.task_id,
            stage = stage.as_str(),
            "Running {} {:?}",
            self.program.display(),
            args
        );

        let mut child = self.spawn(&args)?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| QueueError::Internal("tool stdout was not captured".to_string()))?;

        let (tx, rx) = mpsc::channel::<String>();
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut last = 0.0;
        let mut stopped = false;
        loop {
            let control = match rx.recv_timeout(self.heartbeat) {
                Ok(line) => match parse_tool_line(&line) {
                    ToolLine::Progress(p) => {
                        last = p;
                        progress.report(p)
                    }
                    ToolLine::DownloadingModels => progress.downloading_models(),
                    ToolLine::Other => {
                        debug!(task_id = %request.task_id, "tool: {}", line);
                        ProgressControl::Continue
                    }
                },
                Err(mpsc::RecvTimeoutError::Timeout) => progress.report(last),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            };
            if control.should_stop() {
                stopped = true;
                if let Err(e) = child.kill() {
                    warn!(task_id = %request.task_id, "Failed to kill tool: {}", e);
                }
                break;
            }
        }

        let status = child.wait()?;
        if stopped {
            // Grandchildren may still hold the pipe open; leave the reader behind.
            drop(reader);
            return Ok(false);
        }
        let _ = reader.join();

        if !status.success() {
            return Err(QueueError::ProcessingFailed(format!(
                "{} {} exited with {}",
                self.program.display(),
                stage.as_str(),
                status
            )));
        }
        if !output.exists() {
            return Err(QueueError::ProcessingFailed(format!(
                "{} stage produced no output at {}",
                stage.as_str(),
                output.display()
            )));
        }
        Ok(true)
    }
}

/// Where the upscale stage writes when a second stage follows.
fn intermediate_path(output: &Path, task_id: &str) -> PathBuf {
    let ext = output
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    output.with_file_name(format!(".{task_id}.upscaled{ext}"))
}

impl MediaProcessor for CommandProcessor {
    fn process(
        &mut self,
        request: &ProcessRequest,
        progress: &mut dyn ProgressReporter,
    ) -> QueueResult<ProcessOutcome> {
        if !request.input.is_file() {
            return Err(QueueError::ProcessingFailed(format!(
                "input file not found: {}",
                request.input.display()
            )));
        }
        if let Some(parent) = request.output.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let stages = stages_for(&request.job);
        let span = 100.0 / stages.len() as f64;
        let intermediate = intermediate_path(&request.output, &request.task_id);

        let mut input = request.input.clone();
        for (index, stage) in stages.iter().enumerate() {
            let is_last = index + 1 == stages.len();
            let output = if is_last {
                request.output.clone()
            } else {
                intermediate.clone()
            };

            let mut window = StageProgress::new(&mut *progress, index as f64 * span, span);
            let finished = self.run_stage(request, *stage, &input, &output, &mut window);

            let finished = match finished {
                Ok(finished) => finished,
                Err(e) => {
                    let _ = crate::core::fs::remove_if_exists(&intermediate);
                    return Err(e);
                }
            };
            if !finished {
                let _ = crate::core::fs::remove_if_exists(&intermediate);
                return Ok(ProcessOutcome::Stopped);
            }
            input = output;
        }

        if stages.len() > 1 {
            if let Err(e) = crate::core::fs::remove_if_exists(&intermediate) {
                warn!("Failed to remove {}: {}", intermediate.display(), e);
            }
        }
        progress.report(100.0);

        Ok(ProcessOutcome::Completed {
            output_path: request.output.clone(),
        })
    }
}
