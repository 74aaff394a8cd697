//! Crash Recovery Module
//!
//! Recovers the queue from workers and orchestrators that died mid-task.
//!
//! Features:
//! - Stale claim detection (`claimed_at` older than the configured timeout)
//! - Reset of abandoned tasks back to pending (or cancelled, when asked)
//! - Startup sweep of leftover progress/cancel files

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::core::fs::remove_if_exists;
use crate::core::jobs::{Task, TaskStatus};
use crate::core::queue::{scan_cancel_signals, scan_progress_files, QueueFile};
use crate::core::TaskId;

// =============================================================================
// Stale Claims
// =============================================================================

/// Whether an active task's claim is older than `timeout`.
///
/// Tasks without a claim stamp are aged by `last_updated`.
pub fn is_stale(task: &Task, now: DateTime<Utc>, timeout: Duration) -> bool {
    if !task.is_active() {
        return false;
    }
    let since = task.claimed_at.unwrap_or(task.last_updated);
    now.signed_duration_since(since) > timeout
}

/// How a stale task was resolved
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaleResolution {
    /// Released for a fresh attempt
    Requeued,
    /// The user had asked to cancel it; finalised instead of rerun
    Cancelled,
}

/// Resolves every stale active task, skipping those `still_running` vouches for.
///
/// Tasks with a pending cancel request become cancelled; the rest return to
/// pending. Returns the resolved ids in queue order.
pub fn recover_stale(
    file: &mut QueueFile,
    now: DateTime<Utc>,
    timeout: Duration,
    still_running: impl Fn(&Task) -> bool,
    cancel_requested: impl Fn(&Task) -> bool,
) -> Vec<(TaskId, StaleResolution)> {
    let mut recovered = Vec::new();
    for task in file.tasks.iter_mut() {
        if !is_stale(task, now, timeout) {
            continue;
        }
        if still_running(task) {
            debug!(task_id = %task.id, "Claim is old but the worker is still alive");
            continue;
        }
        if cancel_requested(task) {
            info!(
                task_id = %task.id,
                owner = ?task.owner_id,
                "Stale task had a cancel request; marking cancelled"
            );
            task.process_id = None;
            task.set_status(TaskStatus::Cancelled, now);
            recovered.push((task.id.clone(), StaleResolution::Cancelled));
            continue;
        }
        warn!(
            task_id = %task.id,
            claimed_at = ?task.claimed_at,
            owner = ?task.owner_id,
            "Resetting stale task to pending"
        );
        task.release_to_pending(now);
        recovered.push((task.id.clone(), StaleResolution::Requeued));
    }
    recovered
}

// =============================================================================
// Startup Hygiene
// =============================================================================

/// Deletes leftover progress sidecars and cancel signals.
///
/// Files of an active task are kept. A cancel signal whose task was removed
/// from the queue is kept until it is older than `timeout`, because the
/// removed task's worker may still be running and waiting to see it.
///
/// Returns the number of files removed.
pub fn sweep_orphan_files(
    queue_dir: &Path,
    file: &QueueFile,
    now: DateTime<Utc>,
    timeout: Duration,
) -> usize {
    let mut candidates = Vec::new();
    match scan_progress_files(queue_dir) {
        Ok(found) => candidates.extend(found.into_iter().map(|(id, path)| (id, path, false))),
        Err(e) => warn!("Failed to scan progress files: {}", e),
    }
    match scan_cancel_signals(queue_dir) {
        Ok(found) => candidates.extend(found.into_iter().map(|(id, path)| (id, path, true))),
        Err(e) => warn!("Failed to scan cancel signals: {}", e),
    }

    let mut removed = 0;
    for (task_id, path, is_signal) in candidates {
        match file.tasks.get(&task_id) {
            Some(task) if task.is_active() => continue,
            None if is_signal && !is_older_than(&path, now, timeout) => {
                debug!(task_id = %task_id, "Keeping cancel signal of a removed task");
                continue;
            }
            _ => {}
        }
        match remove_if_exists(&path) {
            Ok(true) => removed += 1,
            Ok(false) => {}
            Err(e) => warn!("Failed to remove leftover {}: {}", path.display(), e),
        }
    }
    if removed > 0 {
        info!("Removed {} leftover task file(s) from {}", removed, queue_dir.display());
    }
    removed
}

/// Whether the file was last modified more than `age` before `now`.
///
/// Files whose age cannot be read count as young.
fn is_older_than(path: &Path, now: DateTime<Utc>, age: Duration) -> bool {
    match std::fs::metadata(path).and_then(|m| m.modified()) {
        Ok(modified) => now.signed_duration_since(DateTime::<Utc>::from(modified)) > age,
        Err(_) => false,
    }
}
