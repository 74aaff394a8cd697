//! Settings Persistence System
//!
//! Provides persistent queue settings with:
//! - Atomic file writes (temp file + rename)
//! - Schema defaults for every field
//! - Normalization of out-of-range values
//!
//! Storage location: {queue_dir}/settings.json

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::fs::atomic_write_json_pretty;
use crate::core::{QueueError, QueueResult};

/// Settings schema version
pub const SETTINGS_VERSION: u32 = 1;

/// Settings file name
pub const SETTINGS_FILE: &str = "settings.json";

/// Lock file name (advisory lock to prevent concurrent writers)
pub const SETTINGS_LOCK_FILE: &str = "settings.json.lock";

/// Name of the worker executable shipped next to the host binary
pub const DEFAULT_WORKER_PROGRAM: &str = "mediaqueue-worker";

/// `~/.mediaqueue/queue`, or `None` without a home directory.
pub fn default_queue_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".mediaqueue").join("queue"))
}

const DEFAULT_STALE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5000;
const DEFAULT_LOCK_RETRY_MS: u64 = 50;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

/// Queue settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    /// Schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Age after which a processing claim is considered abandoned
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// Upper bound on waiting for the queue lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Delay between non-blocking lock attempts
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,

    /// How often hosts should call `poll_updates`
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long `shutdown` waits for workers before killing them
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Worker executable; defaults to `mediaqueue-worker` next to the current executable
    #[serde(default)]
    pub worker_program: Option<PathBuf>,

    /// External enhancement tool used by the worker
    #[serde(default)]
    pub processor: ProcessorSettings,
}

fn default_version() -> u32 {
    SETTINGS_VERSION
}

fn default_stale_timeout_secs() -> u64 {
    DEFAULT_STALE_TIMEOUT_SECS
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT_MS
}

fn default_lock_retry_ms() -> u64 {
    DEFAULT_LOCK_RETRY_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            stale_timeout_secs: DEFAULT_STALE_TIMEOUT_SECS,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            lock_retry_ms: DEFAULT_LOCK_RETRY_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            worker_program: None,
            processor: ProcessorSettings::default(),
        }
    }
}

impl QueueSettings {
    /// Clamp every value into its supported range. Zero timeouts reset to defaults.
    pub fn normalize(&mut self) {
        if self.stale_timeout_secs == 0 {
            self.stale_timeout_secs = DEFAULT_STALE_TIMEOUT_SECS;
        }
        self.stale_timeout_secs = self.stale_timeout_secs.clamp(60, 7 * 86_400);

        if self.lock_timeout_ms == 0 {
            self.lock_timeout_ms = DEFAULT_LOCK_TIMEOUT_MS;
        }
        self.lock_timeout_ms = self.lock_timeout_ms.clamp(100, 60_000);
        self.lock_retry_ms = self.lock_retry_ms.clamp(5, 1000);
        self.poll_interval_ms = self.poll_interval_ms.clamp(50, 10_000);
        self.shutdown_grace_ms = self.shutdown_grace_ms.min(60_000);

        if let Some(program) = &self.worker_program {
            if program.as_os_str().is_empty() {
                self.worker_program = None;
            }
        }
        self.processor.normalize();
    }

    pub fn stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stale_timeout_secs.min(i64::MAX as u64) as i64)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_millis(self.lock_retry_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Resolves the worker executable path.
    pub fn resolve_worker_program(&self) -> PathBuf {
        if let Some(program) = &self.worker_program {
            return program.clone();
        }

        let file_name = format!("{DEFAULT_WORKER_PROGRAM}{}", std::env::consts::EXE_SUFFIX);
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .unwrap_or_else(|| PathBuf::from(file_name))
    }
}

/// External enhancement tool invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSettings {
    /// Tool executable; when unset every task fails with a configuration error
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Argument template; see `processor::CommandProcessor` for placeholders
    #[serde(default = "default_processor_args")]
    pub args: Vec<String>,
}

fn default_processor_args() -> Vec<String> {
    vec!["{input}".to_string(), "{output}".to_string()]
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            program: None,
            args: default_processor_args(),
        }
    }
}

impl ProcessorSettings {
    pub fn normalize(&mut self) {
        if let Some(program) = &self.program {
            if program.as_os_str().is_empty() {
                self.program = None;
            }
        }
        if self.args.is_empty() {
            self.args = default_processor_args();
        }
    }
}

/// Settings manager for loading and saving settings
pub struct SettingsManager {
    settings_path: PathBuf,
}

impl SettingsManager {
    /// Create a settings manager for the given queue directory
    pub fn new(queue_dir: &Path) -> Self {
        Self {
            settings_path: queue_dir.join(SETTINGS_FILE),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.settings_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(SETTINGS_LOCK_FILE)
    }

    fn with_lock<T>(
        &self,
        exclusive: bool,
        op: impl FnOnce() -> QueueResult<T>,
    ) -> QueueResult<T> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;

        if exclusive {
            fs2::FileExt::lock_exclusive(&lock_file)
                .map_err(|e| QueueError::Settings(format!("exclusive lock failed: {e}")))?;
        } else {
            fs2::FileExt::lock_shared(&lock_file)
                .map_err(|e| QueueError::Settings(format!("shared lock failed: {e}")))?;
        }

        let result = op();

        if let Err(e) = fs2::FileExt::unlock(&lock_file) {
            warn!("Failed to unlock settings lock file: {}", e);
        }

        result
    }

    /// Get the settings file path
    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    /// Load settings from disk, returning defaults if the file is missing or invalid
    pub fn load(&self) -> QueueSettings {
        let result = self.with_lock(false, || {
            if !self.settings_path.exists() {
                info!("Settings file not found, using defaults");
                return Ok(QueueSettings::default());
            }

            let content = fs::read_to_string(&self.settings_path)?;
            let mut settings = serde_json::from_str::<QueueSettings>(&content)
                .map_err(|e| QueueError::Settings(format!("failed to parse settings: {e}")))?;
            settings.normalize();
            Ok(settings)
        });

        match result {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Failed to load settings, using defaults: {}", e);
                QueueSettings::default()
            }
        }
    }

    /// Save settings to disk using an atomic write, returning what was persisted
    pub fn save(&self, settings: &QueueSettings) -> QueueResult<QueueSettings> {
        self.with_lock(true, || {
            let mut normalized = settings.clone();
            normalized.normalize();
            atomic_write_json_pretty(&self.settings_path, &normalized)?;
            info!("Settings saved to {}", self.settings_path.display());
            Ok(normalized)
        })
    }
}
