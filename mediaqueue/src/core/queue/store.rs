//! Queue Store
//!
//! The single durable file holding every task plus a small header. All access goes
//! through `load`/`update`, each of which holds the advisory lock on `queue.lock`
//! for the whole read-modify-write cycle, so two processes can never interleave
//! mutations. Writes use temp-file + rename, so readers never see a partial file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, warn};

use crate::core::fs::{atomic_write_json_pretty, quarantine_file};
use crate::core::jobs::Task;
use crate::core::settings::QueueSettings;
use crate::core::{clamp_concurrency, QueueError, QueueResult, MIN_CONCURRENCY};

/// Queue store file name
pub const QUEUE_FILE: &str = "queue.json";

/// Lock file name
pub const LOCK_FILE: &str = "queue.lock";

// =============================================================================
// Task Map
// =============================================================================

/// Tasks keyed by id, iterated in insertion order.
///
/// Serialized as a JSON object; entries are read back in document order so the
/// FIFO order survives every rewrite.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TaskMap {
    entries: Vec<Task>,
}

impl TaskMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.entries.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.entries.iter_mut().find(|t| t.id == id)
    }

    /// Appends a task, or replaces an existing entry in place.
    pub fn insert(&mut self, task: Task) {
        match self.entries.iter_mut().find(|t| t.id == task.id) {
            Some(existing) => *existing = task,
            None => self.entries.push(task),
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Task> {
        let index = self.entries.iter().position(|t| t.id == id)?;
        Some(self.entries.remove(index))
    }

    /// Removes every task matching `pred`, returning them in order.
    pub fn drain_where(&mut self, mut pred: impl FnMut(&Task) -> bool) -> Vec<Task> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.entries.len());
        for task in self.entries.drain(..) {
            if pred(&task) {
                removed.push(task);
            } else {
                kept.push(task);
            }
        }
        self.entries = kept;
        removed
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Task> {
        self.entries.iter_mut()
    }

    pub fn into_vec(self) -> Vec<Task> {
        self.entries
    }
}

impl Serialize for TaskMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for task in &self.entries {
            map.serialize_entry(&task.id, task)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for TaskMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct TaskMapVisitor;

        impl<'de> Visitor<'de> for TaskMapVisitor {
            type Value = TaskMap;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("a map of task id to task")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<TaskMap, A::Error> {
                let mut tasks = TaskMap::new();
                while let Some((key, mut task)) = access.next_entry::<String, Task>()? {
                    // The key is authoritative for lookups.
                    task.id = key;
                    tasks.insert(task);
                }
                Ok(tasks)
            }
        }

        deserializer.deserialize_map(TaskMapVisitor)
    }
}

impl<'a> IntoIterator for &'a TaskMap {
    type Item = &'a Task;
    type IntoIter = std::slice::Iter<'a, Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

// =============================================================================
// Queue File
// =============================================================================

/// On-disk queue content
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueFile {
    /// Worker count each orchestrator aims for, clamped to `[1, 4]`
    #[serde(default = "default_concurrency")]
    pub desired_concurrency: usize,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub tasks: TaskMap,
}

fn default_concurrency() -> usize {
    MIN_CONCURRENCY
}

impl QueueFile {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            desired_concurrency: MIN_CONCURRENCY,
            created_at: now,
            last_updated: now,
            tasks: TaskMap::new(),
        }
    }

    pub fn concurrency(&self) -> usize {
        clamp_concurrency(self.desired_concurrency)
    }

    /// First pending task in insertion order
    pub fn next_pending(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|t| t.status == crate::core::jobs::TaskStatus::Pending)
    }
}

impl Default for QueueFile {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Exclusive hold on `queue.lock`; released on drop.
#[derive(Debug)]
pub struct QueueLock {
    file: File,
}

impl QueueLock {
    /// Retries a non-blocking exclusive lock every `retry` until `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration, retry: Duration) -> QueueResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        loop {
            match fs2::FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(Self { file }),
                Err(e) if Instant::now() >= deadline => {
                    debug!("Giving up on queue lock {}: {}", path.display(), e);
                    return Err(QueueError::LockTimeout {
                        path: path.to_path_buf(),
                        timeout,
                    });
                }
                Err(_) => std::thread::sleep(retry),
            }
        }
    }
}

impl Drop for QueueLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("Failed to release queue lock: {}", e);
        }
    }
}

// =============================================================================
// Store
// =============================================================================

/// Lock-guarded access to `queue.json`
#[derive(Debug)]
pub struct QueueStore {
    dir: PathBuf,
    queue_path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    lock_retry: Duration,
    /// Set after the first quarantine in this process
    quarantined: AtomicBool,
}

impl QueueStore {
    /// Opens (creating if needed) the queue directory with the configured lock timing.
    pub fn open(dir: &Path, settings: &QueueSettings) -> QueueResult<Self> {
        Self::with_timeouts(dir, settings.lock_timeout(), settings.lock_retry())
    }

    pub fn with_timeouts(dir: &Path, lock_timeout: Duration, lock_retry: Duration) -> QueueResult<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            queue_path: dir.join(QUEUE_FILE),
            lock_path: dir.join(LOCK_FILE),
            lock_timeout,
            lock_retry,
            quarantined: AtomicBool::new(false),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Takes the queue lock directly, for callers composing their own cycle.
    pub fn lock(&self) -> QueueResult<QueueLock> {
        QueueLock::acquire(&self.lock_path, self.lock_timeout, self.lock_retry)
    }

    /// Reads the current queue content under the lock.
    pub fn load(&self) -> QueueResult<QueueFile> {
        let _lock = self.lock()?;
        self.read_locked()
    }

    /// Runs one read-modify-write cycle under the lock.
    ///
    /// The file is rewritten only when the closure actually changed the content.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut QueueFile) -> T) -> QueueResult<T> {
        let _lock = self.lock()?;
        let mut file = self.read_locked()?;
        let before = file.clone();

        let result = mutate(&mut file);

        if file != before {
            self.write_locked(&mut file)?;
        }
        Ok(result)
    }

    /// Replaces the whole queue content under the lock.
    pub fn save(&self, file: &QueueFile) -> QueueResult<()> {
        let _lock = self.lock()?;
        let mut file = file.clone();
        self.write_locked(&mut file)
    }

    fn write_locked(&self, file: &mut QueueFile) -> QueueResult<()> {
        file.last_updated = Utc::now();
        file.desired_concurrency = file.concurrency();
        atomic_write_json_pretty(&self.queue_path, file)
    }

    fn read_locked(&self) -> QueueResult<QueueFile> {
        let bytes = match std::fs::read(&self.queue_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut fresh = QueueFile::new();
                self.write_locked(&mut fresh)?;
                return Ok(fresh);
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<QueueFile>(&bytes) {
            Ok(file) => Ok(file),
            Err(parse_err) => {
                self.reset_corrupted(&QueueError::StoreCorrupted(parse_err.to_string()))
            }
        }
    }

    /// Moves a malformed queue file aside (once per process) and starts over empty.
    fn reset_corrupted(&self, reason: &QueueError) -> QueueResult<QueueFile> {
        if !self.quarantined.swap(true, Ordering::SeqCst) {
            match quarantine_file(&self.queue_path) {
                Ok(backup) => warn!(
                    backup = %backup.display(),
                    "{}; moved aside and starting with an empty queue",
                    reason
                ),
                Err(e) => warn!(
                    "{} and could not be moved aside: {}",
                    reason, e
                ),
            }
        } else {
            debug!("Queue store corrupted again; resetting without a new backup");
        }

        let mut fresh = QueueFile::new();
        self.write_locked(&mut fresh)?;
        Ok(fresh)
    }
}
