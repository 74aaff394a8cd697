//! Worker launch abstraction.
//!
//! The orchestrator only needs to start a worker for `(task_id, queue_dir)`, poll
//! it without blocking, and stop it. [`ProcessLauncher`] does this with real OS
//! processes; tests plug in in-memory launchers.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::core::process::{configure_std_command, request_termination};

/// Bytes of worker stderr kept for diagnostics
const DIAGNOSTIC_TAIL_BYTES: u64 = 2048;

/// Exit report of a finished worker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub success: bool,
    pub code: Option<i32>,
}

impl WorkerExit {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Orchestrator-local handle to one running worker
pub trait WorkerHandle: Send {
    /// OS process id, when there is one
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check
    fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>>;

    /// Graceful stop request
    fn terminate(&mut self) -> std::io::Result<()>;

    /// Forced stop
    fn kill(&mut self) -> std::io::Result<()>;

    /// Diagnostic output of a finished worker, for logging only
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// Starts workers for claimed tasks
pub trait WorkerLauncher: Send {
    fn spawn(&self, task_id: &str, queue_dir: &Path) -> std::io::Result<Box<dyn WorkerHandle>>;
}

// =============================================================================
// OS Process Launcher
// =============================================================================

/// Spawns `<program> [leading args] <task_id> <queue_dir>` with stderr captured to
/// `<log_dir>/<task_id>.stderr.log`.
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    program: PathBuf,
    leading_args: Vec<String>,
    log_dir: PathBuf,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
            log_dir: log_dir.into(),
        }
    }

    /// Arguments placed before the task id, e.g. a script for an interpreter.
    pub fn with_leading_args(mut self, args: Vec<String>) -> Self {
        self.leading_args = args;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn spawn(&self, task_id: &str, queue_dir: &Path) -> std::io::Result<Box<dyn WorkerHandle>> {
        std::fs::create_dir_all(&self.log_dir)?;
        let stderr_log = self.log_dir.join(format!("{task_id}.stderr.log"));
        let stderr = File::create(&stderr_log)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args)
            .arg(task_id)
            .arg(queue_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr));
        configure_std_command(&mut cmd);

        let child = cmd.spawn()?;
        debug!(task_id, pid = child.id(), "Spawned {}", self.program.display());
        Ok(Box::new(ProcessHandle { child, stderr_log }))
    }
}

/// Worker running as a child process
#[derive(Debug)]
pub struct ProcessHandle {
    child: Child,
    stderr_log: PathBuf,
}

impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>> {
        let Some(status) = self.child.try_wait()? else {
            return Ok(None);
        };
        let exit = WorkerExit::from_status(status);
        if exit.success {
            let _ = crate::core::fs::remove_if_exists(&self.stderr_log);
        }
        Ok(Some(exit))
    }

    fn terminate(&mut self) -> std::io::Result<()> {
        match request_termination(self.child.id()) {
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => self.child.kill(),
            other => other,
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }

    fn diagnostics(&self) -> Option<String> {
        let mut file = File::open(&self.stderr_log).ok()?;
        let len = file.metadata().ok()?.len();
        file.seek(SeekFrom::Start(len.saturating_sub(DIAGNOSTIC_TAIL_BYTES)))
            .ok()?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).ok()?;
        let text = String::from_utf8_lossy(&buf).trim().to_string();
        (!text.is_empty()).then_some(text)
    }
}
