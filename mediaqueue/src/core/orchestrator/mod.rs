//! Queue Orchestrator
//!
//! The long-lived side of the queue, embedded in the host application. It claims
//! pending tasks, spawns one worker process per claim up to the desired
//! concurrency, reaps finished workers, relays sidecar progress into the store
//! and recovers tasks whose workers died.
//!
//! The orchestrator is driven from a single thread: the host calls
//! [`Orchestrator::poll_updates`] periodically and consumes [`QueueEvent`]s from
//! the receiver returned by [`Orchestrator::take_event_receiver`].

mod launcher;

pub use launcher::*;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::fs::remove_if_exists;
use crate::core::jobs::{EnqueueRequest, Task, TaskStatus};
use crate::core::process::is_process_alive;
use crate::core::queue::{
    read_progress_file, scan_progress_files, EventBus, QueueEvent, QueueStore, TaskFiles,
};
use crate::core::recovery::{recover_stale, sweep_orphan_files, StaleResolution};
use crate::core::settings::{QueueSettings, SettingsManager};
use crate::core::{
    clamp_concurrency, clamp_progress, new_owner_id, OwnerId, QueueError, QueueResult, TaskId,
    MIN_CONCURRENCY,
};

/// Logs a failed store operation and turns it into "nothing happened".
fn soft<T>(operation: &str, result: QueueResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) if e.is_coordination() => {
            warn!("{} skipped: {}", operation, e);
            None
        }
        Err(e) => {
            error!("{} failed: {}", operation, e);
            None
        }
    }
}

/// What one [`Orchestrator::poll_updates`] pass did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PollReport {
    /// Tasks whose worker exited and was reaped
    pub finished: Vec<TaskId>,
    /// Tasks whose sidecar progress was relayed
    pub updated: Vec<TaskId>,
    /// Tasks that got a new worker
    pub started: Vec<TaskId>,
}

impl PollReport {
    pub fn is_empty(&self) -> bool {
        self.finished.is_empty() && self.updated.is_empty() && self.started.is_empty()
    }
}

/// A worker this instance spawned
struct TrackedWorker {
    handle: Box<dyn WorkerHandle>,
    files: TaskFiles,
    cancel_requested: bool,
}

enum CancelAction {
    Missing,
    AlreadyFinished(TaskStatus),
    Cancelled(Task),
    Signal,
}

/// Claim/dispatch loop over one queue directory
pub struct Orchestrator {
    owner_id: OwnerId,
    queue_dir: PathBuf,
    settings: QueueSettings,
    store: QueueStore,
    launcher: Box<dyn WorkerLauncher>,
    workers: HashMap<TaskId, TrackedWorker>,
    /// Sidecar timestamp last merged per task
    relayed: HashMap<TaskId, DateTime<Utc>>,
    events: EventBus,
    /// Cleared for hosts that only edit the queue and never run workers
    dispatch: bool,
}

impl Orchestrator {
    /// Opens a queue directory with its stored settings and the default worker executable.
    pub fn open(queue_dir: &Path) -> QueueResult<Self> {
        let settings = SettingsManager::new(queue_dir).load();
        Self::with_settings(queue_dir, settings)
    }

    pub fn with_settings(queue_dir: &Path, settings: QueueSettings) -> QueueResult<Self> {
        let launcher = ProcessLauncher::new(
            settings.resolve_worker_program(),
            queue_dir.join(crate::LOG_DIR_NAME),
        );
        Self::with_launcher(queue_dir, settings, Box::new(launcher))
    }

    /// Creates an orchestrator, cleans up leftovers and recovers stale tasks.
    pub fn with_launcher(
        queue_dir: &Path,
        mut settings: QueueSettings,
        launcher: Box<dyn WorkerLauncher>,
    ) -> QueueResult<Self> {
        settings.normalize();
        let store = QueueStore::open(queue_dir, &settings)?;
        let mut orchestrator = Self {
            owner_id: new_owner_id(),
            queue_dir: queue_dir.to_path_buf(),
            settings,
            store,
            launcher,
            workers: HashMap::new(),
            relayed: HashMap::new(),
            events: EventBus::new(),
            dispatch: true,
        };
        orchestrator.startup();
        Ok(orchestrator)
    }

    fn startup(&mut self) {
        if let Some(file) = soft("Startup load", self.store.load()) {
            sweep_orphan_files(
                &self.queue_dir,
                &file,
                Utc::now(),
                self.settings.stale_timeout(),
            );
        }
        self.recover_stale_tasks();
        info!(
            owner = %self.owner_id,
            queue_dir = %self.queue_dir.display(),
            "Orchestrator ready"
        );
    }

    /// Turns off claiming and spawning; commands still edit the queue.
    pub fn without_dispatch(mut self) -> Self {
        self.dispatch = false;
        self
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    /// Takes the event receiver (can only be called once)
    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.events.take_receiver()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// All tasks in queue order
    pub fn list_tasks(&self) -> Vec<Task> {
        soft("List tasks", self.store.load())
            .map(|file| file.tasks.into_vec())
            .unwrap_or_default()
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        soft("Get task", self.store.load())?.tasks.get(task_id).cloned()
    }

    /// First pending task in queue order, without claiming it
    pub fn get_next_pending(&self) -> Option<Task> {
        soft("Get next pending", self.store.load())?.next_pending().cloned()
    }

    pub fn desired_concurrency(&self) -> usize {
        soft("Read concurrency", self.store.load())
            .map(|file| file.concurrency())
            .unwrap_or(MIN_CONCURRENCY)
    }

    /// Number of workers this instance is tracking
    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn tracked_task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Validates and appends a task.
    pub fn enqueue(&mut self, request: EnqueueRequest) -> QueueResult<Task> {
        let task = request.into_task()?;
        let stored = task.clone();
        self.store.update(move |file| file.tasks.insert(stored))?;

        info!(
            task_id = %task.id,
            kind = %task.kind(),
            input = %task.input_path.display(),
            "Task queued"
        );
        self.events.emit(QueueEvent::TaskAdded(task.clone()));
        self.events.emit(QueueEvent::QueueChanged);
        Ok(task)
    }

    /// Sets the shared worker target and fills any new capacity.
    pub fn set_concurrency(&mut self, requested: usize) -> QueueResult<usize> {
        let concurrency = clamp_concurrency(requested);
        self.store
            .update(|file| file.desired_concurrency = concurrency)?;
        info!("Concurrency set to {}", concurrency);
        self.events.emit(QueueEvent::QueueChanged);
        self.start_processing();
        Ok(concurrency)
    }

    /// Atomically moves the first pending task to processing under this owner.
    pub fn claim_next_pending(&mut self) -> Option<Task> {
        let owner = self.owner_id.clone();
        let claimed = soft(
            "Claim",
            self.store.update(|file| {
                let task = file
                    .tasks
                    .iter_mut()
                    .find(|t| t.status == TaskStatus::Pending)?;
                task.claim(&owner, Utc::now());
                Some(task.clone())
            }),
        )
        .flatten()?;

        debug!(task_id = %claimed.id, "Claimed task");
        self.events.emit(QueueEvent::TaskUpdated(claimed.clone()));
        Some(claimed)
    }

    /// Recovers stale tasks, then claims and launches until the concurrency target is met.
    pub fn start_processing(&mut self) -> Vec<TaskId> {
        self.recover_stale_tasks();
        if !self.dispatch {
            return Vec::new();
        }

        let Some(desired) = soft("Dispatch", self.store.load()).map(|f| f.concurrency()) else {
            return Vec::new();
        };

        let mut started = Vec::new();
        while self.workers.len() < desired {
            let Some(task) = self.claim_next_pending() else {
                break;
            };
            if self.launch(&task) {
                started.push(task.id);
            }
        }
        started
    }

    fn launch(&mut self, task: &Task) -> bool {
        let files = match TaskFiles::new(&self.queue_dir, &task.id) {
            Ok(files) => files,
            Err(e) => {
                self.mark_failed(&task.id, &e.to_string());
                return false;
            }
        };
        // Leftovers from an earlier attempt must not leak into this one.
        files.cleanup();

        let handle = match self.launcher.spawn(&task.id, &self.queue_dir) {
            Ok(handle) => handle,
            Err(e) => {
                let err = QueueError::SpawnFailed {
                    task_id: task.id.clone(),
                    reason: e.to_string(),
                };
                error!(task_id = %task.id, "{}", err);
                self.mark_failed(&task.id, &err.to_string());
                return false;
            }
        };

        let pid = handle.pid();
        info!(task_id = %task.id, pid = ?pid, "Worker started");
        if let Some(pid) = pid {
            let owner = self.owner_id.clone();
            soft(
                "Record worker pid",
                self.store.update(|file| {
                    if let Some(t) = file.tasks.get_mut(&task.id) {
                        if t.is_active() && t.owner_id.as_deref() == Some(owner.as_str()) {
                            t.process_id = Some(pid);
                        }
                    }
                }),
            );
        }

        self.workers.insert(
            task.id.clone(),
            TrackedWorker {
                handle,
                files,
                cancel_requested: false,
            },
        );
        true
    }

    fn mark_failed(&mut self, task_id: &str, message: &str) {
        let failed = soft(
            "Mark failed",
            self.store.update(|file| {
                let task = file.tasks.get_mut(task_id)?;
                if task.is_terminal() {
                    return None;
                }
                task.error_message = Some(message.to_string());
                task.set_status(TaskStatus::Failed, Utc::now());
                Some(task.clone())
            }),
        )
        .flatten();
        if let Some(task) = failed {
            self.events.emit(QueueEvent::TaskUpdated(task));
        }
    }

    /// One host tick: reap finished workers, relay progress, then top up.
    pub fn poll_updates(&mut self) -> PollReport {
        let finished = self.reap_finished();
        let updated = self.relay_progress();
        let started = self.start_processing();
        PollReport {
            finished,
            updated,
            started,
        }
    }

    fn reap_finished(&mut self) -> Vec<TaskId> {
        let mut exited = Vec::new();
        for (task_id, worker) in self.workers.iter_mut() {
            match worker.handle.try_wait() {
                Ok(Some(exit)) => {
                    let cancel = worker.cancel_requested || worker.files.cancel_requested();
                    exited.push((task_id.clone(), exit, cancel));
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, "Failed to poll worker: {}", e),
            }
        }
        if exited.is_empty() {
            return Vec::new();
        }

        let owner = self.owner_id.clone();
        // Exit statuses are cached by the handles, so a skipped pass is retried next tick.
        let Some(snapshots) = soft(
            "Reap",
            self.store.update(|file| {
                let now = Utc::now();
                exited
                    .iter()
                    .map(|(task_id, _, cancel)| {
                        let task = file.tasks.get_mut(task_id)?;
                        if *cancel
                            && !task.is_terminal()
                            && task.owner_id.as_deref() == Some(owner.as_str())
                        {
                            task.set_status(TaskStatus::Cancelled, now);
                        }
                        Some(task.clone())
                    })
                    .collect::<Vec<_>>()
            }),
        ) else {
            return Vec::new();
        };

        let mut finished = Vec::with_capacity(exited.len());
        for ((task_id, exit, _), snapshot) in exited.into_iter().zip(snapshots) {
            let Some(worker) = self.workers.remove(&task_id) else {
                continue;
            };
            let diagnostics = if exit.success {
                None
            } else {
                worker.handle.diagnostics()
            };

            match snapshot {
                None => debug!(task_id = %task_id, %exit, "Worker for removed task exited"),
                Some(task) if task.is_terminal() => {
                    match task.status {
                        TaskStatus::Failed => warn!(
                            task_id = %task_id,
                            %exit,
                            "Task failed: {}",
                            task.error_message.as_deref().unwrap_or("unknown error")
                        ),
                        status => info!(task_id = %task_id, %exit, "Task {}", status),
                    }
                    self.events.emit(QueueEvent::TaskUpdated(task));
                }
                Some(task) => warn!(
                    task_id = %task_id,
                    %exit,
                    status = %task.status,
                    "Worker exited without recording a result; left for stale recovery"
                ),
            }
            if let Some(text) = diagnostics {
                warn!(task_id = %task_id, "Worker stderr:\n{}", text);
            }

            worker.files.cleanup();
            self.relayed.remove(&task_id);
            finished.push(task_id);
        }
        finished
    }

    fn relay_progress(&mut self) -> Vec<TaskId> {
        let sidecars = match scan_progress_files(&self.queue_dir) {
            Ok(found) => found,
            Err(e) => {
                warn!("Failed to scan progress files: {}", e);
                return Vec::new();
            }
        };

        // Sidecars that disappeared (including other hosts' tasks) need no bookkeeping.
        let present: HashSet<&TaskId> = sidecars.iter().map(|(id, _)| id).collect();
        self.relayed.retain(|id, _| present.contains(id));

        let mut records = Vec::new();
        for (task_id, path) in sidecars {
            match read_progress_file(&path) {
                Ok(Some(record)) => {
                    if self.relayed.get(&task_id) != Some(&record.timestamp) {
                        records.push((task_id, path, record));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(task_id = %task_id, "Unreadable progress file: {}", e),
            }
        }
        if records.is_empty() {
            return Vec::new();
        }

        let tracked: HashSet<&TaskId> = self.workers.keys().collect();
        let Some((updated, orphans)) = soft(
            "Relay progress",
            self.store.update(|file| {
                let now = Utc::now();
                let mut updated = Vec::new();
                let mut orphans = Vec::new();
                for (task_id, path, record) in &records {
                    match file.tasks.get_mut(task_id) {
                        Some(task) if task.is_active() => {
                            let status = record
                                .status
                                .filter(|s| s.is_active())
                                .unwrap_or(task.status);
                            let progress = clamp_progress(record.progress);
                            if task.progress != progress || task.status != status {
                                task.progress = progress;
                                task.set_status(status, now);
                            }
                            updated.push((task.clone(), record.timestamp));
                        }
                        // The reap of our own worker removes it.
                        Some(_) if tracked.contains(task_id) => {}
                        _ => orphans.push(path.clone()),
                    }
                }
                (updated, orphans)
            }),
        ) else {
            return Vec::new();
        };

        for path in orphans {
            if let Err(e) = remove_if_exists(&path) {
                warn!("Failed to remove orphan {}: {}", path.display(), e);
            }
        }

        let mut ids = Vec::with_capacity(updated.len());
        for (task, timestamp) in updated {
            self.relayed.insert(task.id.clone(), timestamp);
            ids.push(task.id.clone());
            self.events.emit(QueueEvent::TaskUpdated(task));
        }
        ids
    }

    /// Resets stale processing claims back to pending.
    pub fn recover_stale_tasks(&mut self) -> Vec<TaskId> {
        self.recover_stale_tasks_at(Utc::now())
    }

    /// [`Self::recover_stale_tasks`] evaluated at a given instant.
    ///
    /// A stale task the user asked to cancel is finalised as cancelled instead.
    pub fn recover_stale_tasks_at(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let timeout = self.settings.stale_timeout();
        let queue_dir = &self.queue_dir;
        let workers = &self.workers;
        let Some(recovered) = soft(
            "Stale recovery",
            self.store.update(|file| {
                let resolved = recover_stale(
                    file,
                    now,
                    timeout,
                    |task| {
                        workers.contains_key(&task.id)
                            || task.process_id.is_some_and(is_process_alive)
                    },
                    |task| {
                        TaskFiles::new(queue_dir, &task.id)
                            .is_ok_and(|files| files.cancel_requested())
                    },
                );
                resolved
                    .into_iter()
                    .filter_map(|(id, how)| file.tasks.get(&id).cloned().map(|t| (t, how)))
                    .collect::<Vec<_>>()
            }),
        ) else {
            return Vec::new();
        };

        if recovered.is_empty() {
            return Vec::new();
        }
        let mut ids = Vec::with_capacity(recovered.len());
        for (task, how) in recovered {
            if how == StaleResolution::Cancelled {
                // Its worker is gone; nothing is left to read the signal.
                if let Ok(files) = TaskFiles::new(&self.queue_dir, &task.id) {
                    files.cleanup();
                }
            }
            self.relayed.remove(&task.id);
            ids.push(task.id.clone());
            self.events.emit(QueueEvent::TaskUpdated(task));
        }
        self.events.emit(QueueEvent::QueueChanged);
        ids
    }

    /// Cancels a task. Returns `false` when nothing changed.
    ///
    /// Queued tasks are cancelled directly; running tasks get a cancel signal file
    /// plus a termination request when this instance owns the worker.
    pub fn cancel(&mut self, task_id: &str) -> bool {
        let action = soft(
            "Cancel",
            self.store.update(|file| match file.tasks.get_mut(task_id) {
                None => CancelAction::Missing,
                Some(task) if task.is_terminal() => CancelAction::AlreadyFinished(task.status),
                Some(task) if task.is_active() => CancelAction::Signal,
                Some(task) => {
                    task.set_status(TaskStatus::Cancelled, Utc::now());
                    CancelAction::Cancelled(task.clone())
                }
            }),
        );

        match action {
            None => false,
            Some(CancelAction::Missing) => {
                debug!(task_id, "Cancel ignored: no such task");
                false
            }
            Some(CancelAction::AlreadyFinished(status)) => {
                debug!(task_id, %status, "Cancel ignored: task already finished");
                false
            }
            Some(CancelAction::Cancelled(task)) => {
                info!(task_id, "Task cancelled");
                self.events.emit(QueueEvent::TaskUpdated(task));
                true
            }
            Some(CancelAction::Signal) => {
                self.signal_cancel(task_id);
                true
            }
        }
    }

    fn signal_cancel(&mut self, task_id: &str) {
        match TaskFiles::new(&self.queue_dir, task_id) {
            Ok(files) => {
                if let Err(e) = files.request_cancel() {
                    error!(task_id, "Failed to create cancel signal: {}", e);
                }
            }
            Err(e) => warn!(task_id, "Cannot signal cancellation: {}", e),
        }

        if let Some(worker) = self.workers.get_mut(task_id) {
            worker.cancel_requested = true;
            if let Err(e) = worker.handle.terminate() {
                warn!(task_id, "Failed to signal worker: {}", e);
            }
        }
        info!(task_id, "Cancellation requested");
    }

    /// Deletes a task from the queue, cancelling it first if it is running.
    pub fn remove(&mut self, task_id: &str) -> bool {
        let Some(task) = self.get_task(task_id) else {
            return false;
        };
        if task.is_active() {
            self.signal_cancel(task_id);
        }

        let Some(removed) =
            soft("Remove", self.store.update(|file| file.tasks.remove(task_id))).flatten()
        else {
            return false;
        };

        if let Ok(files) = TaskFiles::new(&self.queue_dir, task_id) {
            if removed.is_active() || self.workers.contains_key(task_id) {
                // The worker still has to see the cancel signal; reap or the startup sweep drops it.
                if let Err(e) = files.remove_progress() {
                    warn!(task_id, "Failed to remove progress file: {}", e);
                }
            } else {
                files.cleanup();
            }
        }
        self.relayed.remove(task_id);

        info!(task_id, "Task removed");
        self.events
            .emit(QueueEvent::TaskRemoved(task_id.to_string()));
        self.events.emit(QueueEvent::QueueChanged);
        true
    }

    /// Holds back every pending task; running tasks are left to finish.
    pub fn pause(&mut self) -> usize {
        self.transition_all(TaskStatus::Pending, TaskStatus::Paused, "Pause")
    }

    /// Releases paused tasks and dispatches them.
    pub fn resume(&mut self) -> usize {
        let resumed = self.transition_all(TaskStatus::Paused, TaskStatus::Pending, "Resume");
        self.start_processing();
        resumed
    }

    fn transition_all(&mut self, from: TaskStatus, to: TaskStatus, operation: &str) -> usize {
        let changed = soft(
            operation,
            self.store.update(|file| {
                let now = Utc::now();
                let mut changed = Vec::new();
                for task in file.tasks.iter_mut().filter(|t| t.status == from) {
                    task.set_status(to, now);
                    changed.push(task.clone());
                }
                changed
            }),
        )
        .unwrap_or_default();

        let count = changed.len();
        info!("{}: {} task(s) {} -> {}", operation, count, from, to);
        if count > 0 {
            for task in changed {
                self.events.emit(QueueEvent::TaskUpdated(task));
            }
            self.events.emit(QueueEvent::QueueChanged);
        }
        count
    }

    /// Deletes every completed, failed or cancelled task.
    pub fn clear_completed(&mut self) -> usize {
        let removed = soft(
            "Clear completed",
            self.store.update(|file| file.tasks.drain_where(|t| t.is_terminal())),
        )
        .unwrap_or_default();

        for task in &removed {
            if !self.workers.contains_key(&task.id) {
                if let Ok(files) = TaskFiles::new(&self.queue_dir, &task.id) {
                    files.cleanup();
                }
            }
            self.relayed.remove(&task.id);
            self.events.emit(QueueEvent::TaskRemoved(task.id.clone()));
        }
        if !removed.is_empty() {
            info!("Cleared {} finished task(s)", removed.len());
            self.events.emit(QueueEvent::QueueChanged);
        }
        removed.len()
    }

    /// Stops every tracked worker and hands unfinished tasks back to the queue.
    ///
    /// Workers get a termination request and `shutdownGraceMs` to exit before
    /// being killed. Tasks the user did not cancel return to pending.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        info!("Shutting down {} worker(s)", self.workers.len());

        for (task_id, worker) in self.workers.iter_mut() {
            if let Err(e) = worker.handle.terminate() {
                warn!(task_id = %task_id, "Failed to signal worker: {}", e);
            }
        }

        let deadline = Instant::now() + self.settings.shutdown_grace();
        let mut running: Vec<TaskId> = self.workers.keys().cloned().collect();
        loop {
            running.retain(|id| {
                self.workers
                    .get_mut(id)
                    .is_some_and(|w| matches!(w.handle.try_wait(), Ok(None)))
            });
            let now = Instant::now();
            if running.is_empty() || now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }

        for task_id in &running {
            if let Some(worker) = self.workers.get_mut(task_id) {
                warn!(task_id = %task_id, "Worker did not exit in time; killing");
                if let Err(e) = worker.handle.kill() {
                    error!(task_id = %task_id, "Failed to kill worker: {}", e);
                }
                let _ = worker.handle.try_wait();
            }
        }

        let interrupted: Vec<(TaskId, bool)> = self
            .workers
            .iter()
            .map(|(id, w)| (id.clone(), w.cancel_requested || w.files.cancel_requested()))
            .collect();
        let owner = self.owner_id.clone();
        let changed = soft(
            "Shutdown",
            self.store.update(|file| {
                let now = Utc::now();
                let mut changed = Vec::new();
                for (task_id, user_cancelled) in &interrupted {
                    let Some(task) = file.tasks.get_mut(task_id) else {
                        continue;
                    };
                    if task.owner_id.as_deref() != Some(owner.as_str()) {
                        continue;
                    }
                    let interrupted_by_us = task.is_active()
                        || (task.status == TaskStatus::Cancelled && !user_cancelled);
                    if !interrupted_by_us {
                        continue;
                    }
                    if *user_cancelled {
                        task.set_status(TaskStatus::Cancelled, now);
                    } else {
                        task.release_to_pending(now);
                    }
                    changed.push(task.clone());
                }
                changed
            }),
        )
        .unwrap_or_default();

        for (_, worker) in self.workers.drain() {
            worker.files.cleanup();
        }
        self.relayed.clear();

        for task in changed {
            self.events.emit(QueueEvent::TaskUpdated(task));
        }
        self.events.emit(QueueEvent::QueueChanged);
        info!("Orchestrator shut down");
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory worker launcher.

    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use super::{WorkerExit, WorkerHandle, WorkerLauncher};

    #[derive(Debug, Default)]
    pub struct FakeWorker {
        pub exit: Option<WorkerExit>,
        pub terminated: bool,
        pub killed: bool,
    }

    #[derive(Default)]
    struct Shared {
        workers: HashMap<String, FakeWorker>,
        spawned: Vec<String>,
        fail_spawn: bool,
        exit_on_terminate: bool,
    }

    /// Records spawns; tests decide when each fake worker exits.
    #[derive(Clone, Default)]
    pub struct FakeLauncher {
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeLauncher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            let launcher = Self::default();
            launcher.shared.lock().unwrap().fail_spawn = true;
            launcher
        }

        /// Workers exit as soon as they are asked to terminate.
        pub fn exit_on_terminate(self) -> Self {
            self.shared.lock().unwrap().exit_on_terminate = true;
            self
        }

        pub fn spawned(&self) -> Vec<String> {
            self.shared.lock().unwrap().spawned.clone()
        }

        pub fn exit(&self, task_id: &str, success: bool) {
            let mut shared = self.shared.lock().unwrap();
            let worker = shared.workers.entry(task_id.to_string()).or_default();
            worker.exit = Some(WorkerExit {
                success,
                code: Some(if success { 0 } else { 1 }),
            });
        }

        pub fn was_terminated(&self, task_id: &str) -> bool {
            self.shared
                .lock()
                .unwrap()
                .workers
                .get(task_id)
                .is_some_and(|w| w.terminated)
        }

        pub fn was_killed(&self, task_id: &str) -> bool {
            self.shared
                .lock()
                .unwrap()
                .workers
                .get(task_id)
                .is_some_and(|w| w.killed)
        }
    }

    impl WorkerLauncher for FakeLauncher {
        fn spawn(&self, task_id: &str, _queue_dir: &Path) -> std::io::Result<Box<dyn WorkerHandle>> {
            let mut shared = self.shared.lock().unwrap();
            if shared.fail_spawn {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "worker executable not found",
                ));
            }
            shared.spawned.push(task_id.to_string());
            shared
                .workers
                .insert(task_id.to_string(), FakeWorker::default());
            Ok(Box::new(FakeHandle {
                task_id: task_id.to_string(),
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct FakeHandle {
        task_id: String,
        shared: Arc<Mutex<Shared>>,
    }

    impl FakeHandle {
        fn with<T>(&self, f: impl FnOnce(&mut FakeWorker, bool) -> T) -> T {
            let mut shared = self.shared.lock().unwrap();
            let exit_on_terminate = shared.exit_on_terminate;
            let worker = shared.workers.entry(self.task_id.clone()).or_default();
            f(worker, exit_on_terminate)
        }
    }

    impl WorkerHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn try_wait(&mut self) -> std::io::Result<Option<WorkerExit>> {
            Ok(self.with(|w, _| w.exit))
        }

        fn terminate(&mut self) -> std::io::Result<()> {
            self.with(|w, exit_on_terminate| {
                w.terminated = true;
                if exit_on_terminate && w.exit.is_none() {
                    w.exit = Some(WorkerExit {
                        success: false,
                        code: None,
                    });
                }
            });
            Ok(())
        }

        fn kill(&mut self) -> std::io::Result<()> {
            self.with(|w, _| {
                w.killed = true;
                if w.exit.is_none() {
                    w.exit = Some(WorkerExit {
                        success: false,
                        code: None,
                    });
                }
            });
            Ok(())
        }
    }
}
