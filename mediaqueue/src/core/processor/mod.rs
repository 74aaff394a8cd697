//! Processing Routine Contract
//!
//! The scheduler never looks inside the enhancement algorithms. A worker hands a
//! [`ProcessRequest`] to a [`MediaProcessor`] together with a progress callback,
//! and the callback's return value is the only way cancellation reaches the
//! routine.

mod command;

pub use command::*;

use std::path::PathBuf;

use crate::core::jobs::MediaJob;
use crate::core::{QueueResult, TaskId};

/// Answer from a progress callback
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressControl {
    Continue,
    Stop,
}

impl ProgressControl {
    pub fn should_stop(self) -> bool {
        self == ProgressControl::Stop
    }
}

/// Progress callback handed to a processing routine.
pub trait ProgressReporter {
    /// Reports overall progress in percent.
    fn report(&mut self, percent: f64) -> ProgressControl;

    /// Signals that model weights are being fetched before real work starts.
    fn downloading_models(&mut self) -> ProgressControl {
        ProgressControl::Continue
    }
}

impl<F> ProgressReporter for F
where
    F: FnMut(f64) -> ProgressControl,
{
    fn report(&mut self, percent: f64) -> ProgressControl {
        self(percent)
    }
}

/// Maps a sub-range of work onto `[offset, offset + span]` of the overall progress.
pub struct StageProgress<'a, R: ProgressReporter + ?Sized> {
    inner: &'a mut R,
    offset: f64,
    span: f64,
}

impl<'a, R: ProgressReporter + ?Sized> StageProgress<'a, R> {
    pub fn new(inner: &'a mut R, offset: f64, span: f64) -> Self {
        Self {
            inner,
            offset,
            span,
        }
    }
}

impl<R: ProgressReporter + ?Sized> ProgressReporter for StageProgress<'_, R> {
    fn report(&mut self, percent: f64) -> ProgressControl {
        let local = crate::core::clamp_progress(percent);
        self.inner.report(self.offset + local * self.span / 100.0)
    }

    fn downloading_models(&mut self) -> ProgressControl {
        self.inner.downloading_models()
    }
}

/// One unit of work for a processing routine
#[derive(Clone, Debug)]
pub struct ProcessRequest {
    pub task_id: TaskId,
    pub input: PathBuf,
    pub output: PathBuf,
    pub job: MediaJob,
}

/// How a processing routine finished
#[derive(Clone, Debug, PartialEq)]
pub enum ProcessOutcome {
    /// Output was written
    Completed { output_path: PathBuf },
    /// The progress callback asked to stop
    Stopped,
}

/// External enhancement routine
pub trait MediaProcessor {
    fn process(
        &mut self,
        request: &ProcessRequest,
        progress: &mut dyn ProgressReporter,
    ) -> QueueResult<ProcessOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_reporters() {
        let mut seen = Vec::new();
        let mut reporter = |p: f64| {
            seen.push(p);
            ProgressControl::Continue
        };
        assert_eq!(reporter.report(12.5), ProgressControl::Continue);
        assert_eq!(reporter.downloading_models(), ProgressControl::Continue);
        assert_eq!(seen, vec![12.5]);
    }

    #[test]
    fn stage_progress_maps_into_its_window() {
        let mut seen = Vec::new();
        let mut outer = |p: f64| {
            seen.push(p);
            ProgressControl::Continue
        };
        {
            let mut first = StageProgress::new(&mut outer, 0.0, 50.0);
            first.report(0.0);
            first.report(100.0);
        }
        {
            let mut second = StageProgress::new(&mut outer, 50.0, 50.0);
            second.report(50.0);
            second.report(250.0);
        }
        assert_eq!(seen, vec![0.0, 50.0, 75.0, 100.0]);
    }

    #[test]
    fn stop_propagates_through_stages() {
        let mut outer = |p: f64| {
            if p >= 60.0 {
                ProgressControl::Stop
            } else {
                ProgressControl::Continue
            }
        };
        let mut stage = StageProgress::new(&mut outer, 50.0, 50.0);
        assert!(!stage.report(10.0).should_stop());
        assert!(stage.report(40.0).should_stop());
    }
}
