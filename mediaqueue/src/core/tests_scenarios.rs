//! Queue Scenario Tests
//!
//! Multi-step flows across the store, sidecar files and orchestrator, with the
//! worker side simulated by writing the files a real worker would write.

use std::collections::HashSet;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::jobs::{EnqueueRequest, Task, TaskStatus, UpscaleParams};
use crate::core::orchestrator::testing::FakeLauncher;
use crate::core::orchestrator::Orchestrator;
use crate::core::processor::{MediaProcessor, ProcessOutcome, ProcessRequest, ProgressReporter};
use crate::core::queue::{QueueEvent, QueueStore, TaskFiles};
use crate::core::settings::QueueSettings;
use crate::core::worker::{TaskWorker, WorkerOutcome};
use crate::core::QueueResult;

fn settings() -> QueueSettings {
    QueueSettings {
        lock_timeout_ms: 5000,
        lock_retry_ms: 2,
        shutdown_grace_ms: 100,
        ..Default::default()
    }
}

fn orchestrator(dir: &TempDir, launcher: &FakeLauncher) -> Orchestrator {
    Orchestrator::with_launcher(dir.path(), settings(), Box::new(launcher.clone())).unwrap()
}

fn image(name: &str) -> EnqueueRequest {
    EnqueueRequest::image(format!("/media/{name}.png"), UpscaleParams::default())
}

fn updates_for(rx: &mut UnboundedReceiver<QueueEvent>, task_id: &str) -> Vec<Task> {
    let mut updates = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let QueueEvent::TaskUpdated(task) = event {
            if task.id == task_id {
                updates.push(task);
            }
        }
    }
    updates
}

/// What a worker does when it finishes: final status under the claim, then drop the sidecar.
fn finish_as_worker(orch: &Orchestrator, files: &TaskFiles, status: TaskStatus) {
    let task_id = files.task_id().to_string();
    orch.store()
        .update(|file| {
            let task = file.tasks.get_mut(&task_id).unwrap();
            if status == TaskStatus::Completed {
                task.progress = 100.0;
                task.output_path = Some(task.default_output_path());
            }
            task.set_status(status, Utc::now());
        })
        .unwrap();
    files.remove_progress().unwrap();
}

#[test]
fn task_runs_from_enqueue_to_completion() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let mut rx = orch.take_event_receiver().unwrap();

    let task = orch.enqueue(image("holiday")).unwrap();
    assert_eq!(orch.start_processing(), vec![task.id.clone()]);
    assert_eq!(launcher.spawned(), vec![task.id.clone()]);
    let claimed = updates_for(&mut rx, &task.id);
    assert_eq!(claimed.last().unwrap().status, TaskStatus::Processing);
    assert_eq!(claimed.last().unwrap().owner_id.as_deref(), Some(orch.owner_id()));

    let files = TaskFiles::new(dir.path(), &task.id).unwrap();
    for percent in [0.0, 50.0] {
        files
            .write_progress(percent, Some(TaskStatus::Processing))
            .unwrap();
        let report = orch.poll_updates();
        assert_eq!(report.updated, vec![task.id.clone()]);
        let updates = updates_for(&mut rx, &task.id);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].progress, percent);
        std::thread::sleep(Duration::from_millis(2));
    }

    // Unchanged sidecar is not relayed twice.
    assert!(orch.poll_updates().updated.is_empty());

    files
        .write_progress(100.0, Some(TaskStatus::Processing))
        .unwrap();
    finish_as_worker(&orch, &files, TaskStatus::Completed);
    launcher.exit(&task.id, true);

    let report = orch.poll_updates();
    assert_eq!(report.finished, vec![task.id.clone()]);
    let updates = updates_for(&mut rx, &task.id);
    let done = updates.last().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.progress, 100.0);
    assert!(done.output_path.is_some());
    assert!(!files.progress_path().exists());
    assert_eq!(orch.active_count(), 0);
}

#[test]
fn cancelled_running_task_cleans_up_signal_files() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let task = orch.enqueue(image("clip")).unwrap();
    orch.start_processing();

    let files = TaskFiles::new(dir.path(), &task.id).unwrap();
    files
        .write_progress(30.0, Some(TaskStatus::Processing))
        .unwrap();
    orch.poll_updates();

    assert!(orch.cancel(&task.id));
    assert!(files.cancel_path().exists());
    assert!(launcher.was_terminated(&task.id));

    // Worker notices the signal and records the cancellation itself.
    orch.store()
        .update(|file| {
            let t = file.tasks.get_mut(&task.id).unwrap();
            t.set_status(TaskStatus::Cancelled, Utc::now());
        })
        .unwrap();
    launcher.exit(&task.id, false);

    orch.poll_updates();
    assert_eq!(orch.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    assert!(!files.cancel_path().exists());
    assert!(!files.progress_path().exists());
    assert_eq!(launcher.spawned().len(), 1);
}

#[test]
fn pause_holds_pending_tasks_but_not_running_ones() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let running = orch.enqueue(image("a")).unwrap();
    let second = orch.enqueue(image("b")).unwrap();
    let third = orch.enqueue(image("c")).unwrap();
    orch.start_processing();

    assert_eq!(orch.pause(), 2);
    assert_eq!(orch.get_task(&running.id).unwrap().status, TaskStatus::Processing);
    assert_eq!(orch.get_task(&second.id).unwrap().status, TaskStatus::Paused);

    // Paused work is never claimed, even with spare capacity.
    orch.set_concurrency(4).unwrap();
    assert_eq!(launcher.spawned(), vec![running.id.clone()]);
    assert!(orch.get_next_pending().is_none());

    orch.set_concurrency(1).unwrap();
    assert_eq!(orch.resume(), 2);
    assert_eq!(orch.active_count(), 1);

    let files = TaskFiles::new(dir.path(), &running.id).unwrap();
    finish_as_worker(&orch, &files, TaskStatus::Completed);
    launcher.exit(&running.id, true);
    let report = orch.poll_updates();
    assert_eq!(report.finished, vec![running.id.clone()]);
    assert_eq!(report.started, vec![second.id.clone()]);
    assert_eq!(orch.get_task(&third.id).unwrap().status, TaskStatus::Pending);
}

#[test]
fn claims_follow_enqueue_order() {
    let dir = TempDir::new().unwrap();
    let mut orch = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    let ids: Vec<_> = ["first", "second", "third"]
        .into_iter()
        .map(|name| orch.enqueue(image(name)).unwrap().id)
        .collect();

    let claimed: Vec<_> = std::iter::from_fn(|| orch.claim_next_pending())
        .map(|t| t.id)
        .collect();
    assert_eq!(claimed, ids);
}

#[test]
fn concurrent_claimers_never_share_a_task() {
    let dir = TempDir::new().unwrap();
    let seed = QueueStore::open(dir.path(), &settings()).unwrap();
    let total = 40;
    seed.update(|file| {
        for i in 0..total {
            file.tasks.insert(image(&format!("t{i}")).into_task().unwrap());
        }
    })
    .unwrap();

    let claims: Vec<Vec<String>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|n| {
                let path = dir.path();
                scope.spawn(move || {
                    let store = QueueStore::open(path, &settings()).unwrap();
                    let owner = format!("owner-{n}");
                    let mut mine = Vec::new();
                    loop {
                        let claimed = store
                            .update(|file| {
                                let task = file
                                    .tasks
                                    .iter_mut()
                                    .find(|t| t.status == TaskStatus::Pending)?;
                                task.claim(&owner, Utc::now());
                                Some(task.id.clone())
                            })
                            .unwrap();
                        match claimed {
                            Some(id) => mine.push(id),
                            None => break,
                        }
                    }
                    mine
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let all: Vec<_> = claims.into_iter().flatten().collect();
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), total);
    assert_eq!(unique.len(), total);

    let file = seed.load().unwrap();
    assert!(file.tasks.iter().all(|t| t.status == TaskStatus::Processing));
}

#[test]
fn stale_recovery_is_idempotent_across_orchestrators() {
    let dir = TempDir::new().unwrap();
    let mut first = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    let mut second = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    let task = first.enqueue(image("old")).unwrap();

    let now = Utc::now();
    first
        .store()
        .update(|file| {
            let t = file.tasks.get_mut(&task.id).unwrap();
            t.claim("gone-host", now - chrono::Duration::hours(2));
            t.progress = 80.0;
        })
        .unwrap();

    assert_eq!(first.recover_stale_tasks_at(now), vec![task.id.clone()]);
    assert!(second.recover_stale_tasks_at(now).is_empty());
    assert!(first.recover_stale_tasks_at(now).is_empty());

    let recovered = second.get_task(&task.id).unwrap();
    assert_eq!(recovered.status, TaskStatus::Pending);
    assert_eq!(recovered.progress, 0.0);
    assert!(recovered.owner_id.is_none());
    assert!(recovered.claimed_at.is_none());
}

#[test]
fn cancelled_task_of_a_dead_worker_is_not_rerun() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let task = orch.enqueue(image("abandoned")).unwrap();
    let now = Utc::now();
    orch.store()
        .update(|file| {
            file.tasks
                .get_mut(&task.id)
                .unwrap()
                .claim("gone-host", now - chrono::Duration::hours(2));
        })
        .unwrap();

    assert!(orch.cancel(&task.id));
    let files = TaskFiles::new(dir.path(), &task.id).unwrap();
    assert!(files.cancel_requested());

    assert_eq!(orch.recover_stale_tasks_at(now), vec![task.id.clone()]);
    assert_eq!(orch.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    assert!(!files.cancel_requested());

    assert!(orch.start_processing().is_empty());
    assert!(launcher.spawned().is_empty());
}

#[test]
fn removing_a_running_task_from_another_process_keeps_its_signal() {
    let dir = TempDir::new().unwrap();
    let launcher = FakeLauncher::new();
    let mut host = orchestrator(&dir, &launcher);
    let task = host.enqueue(image("long")).unwrap();
    host.start_processing();

    // One-shot commands run in their own processes, each with a fresh orchestrator.
    let mut remover = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    assert!(remover.remove(&task.id));
    let files = TaskFiles::new(dir.path(), &task.id).unwrap();
    assert!(files.cancel_requested());

    let lister = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    assert!(lister.list_tasks().is_empty());
    assert!(files.cancel_requested());

    // The worker sees the signal and exits; its host reaps it and drops the file.
    launcher.exit(&task.id, false);
    assert_eq!(host.poll_updates().finished, vec![task.id.clone()]);
    assert!(!files.cancel_requested());
}

#[test]
fn fresh_claims_are_not_recovered() {
    let dir = TempDir::new().unwrap();
    let mut orch = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    let task = orch.enqueue(image("fresh")).unwrap();
    let now = Utc::now();
    orch.store()
        .update(|file| {
            file.tasks
                .get_mut(&task.id)
                .unwrap()
                .claim("other-host", now - chrono::Duration::minutes(5));
        })
        .unwrap();

    assert!(orch.recover_stale_tasks_at(now).is_empty());
    assert_eq!(orch.get_task(&task.id).unwrap().status, TaskStatus::Processing);
}

#[test]
fn corrupted_store_starts_empty_and_keeps_working() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("queue.json"), b"{\"tasks\": [truncated").unwrap();

    let mut orch = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
    assert!(orch.list_tasks().is_empty());

    let backups = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
        .count();
    assert_eq!(backups, 1);

    let task = orch.enqueue(image("after")).unwrap();
    assert_eq!(orch.list_tasks()[0].id, task.id);
}

#[test]
fn startup_sweeps_files_of_finished_tasks() {
    let dir = TempDir::new().unwrap();
    let task = {
        let mut orch = orchestrator(&dir, &FakeLauncher::new()).without_dispatch();
        let task = orch.enqueue(image("done")).unwrap();
        orch.cancel(&task.id);
        task
    };
    let files = TaskFiles::new(dir.path(), &task.id).unwrap();
    files.write_progress(42.0, None).unwrap();
    files.request_cancel().unwrap();

    let _orch = orchestrator(&dir, &FakeLauncher::new());
    assert!(!files.progress_path().exists());
    assert!(!files.cancel_path().exists());
}

/// Writes a marker file as the enhanced output.
struct CopyProcessor;

impl MediaProcessor for CopyProcessor {
    fn process(
        &mut self,
        request: &ProcessRequest,
        progress: &mut dyn ProgressReporter,
    ) -> QueueResult<ProcessOutcome> {
        for percent in [10.0, 60.0] {
            if progress.report(percent).should_stop() {
                return Ok(ProcessOutcome::Stopped);
            }
        }
        std::fs::copy(&request.input, &request.output)?;
        progress.report(100.0);
        Ok(ProcessOutcome::Completed {
            output_path: request.output.clone(),
        })
    }
}

#[test]
fn in_process_worker_completes_a_claimed_task() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("photo.png");
    std::fs::write(&input, b"pixels").unwrap();

    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let mut rx = orch.take_event_receiver().unwrap();
    let task = orch
        .enqueue(EnqueueRequest::image(&input, UpscaleParams::default()).require_existing_input())
        .unwrap();
    orch.start_processing();

    let worker = TaskWorker::new(&task.id, dir.path(), &settings()).unwrap();
    let outcome = worker.run(&mut CopyProcessor);
    let expected = dir.path().join("photo_upscaled_2x.png");
    assert_eq!(
        outcome,
        WorkerOutcome::Completed {
            output_path: expected.clone()
        }
    );
    assert_eq!(std::fs::read(&expected).unwrap(), b"pixels");

    launcher.exit(&task.id, true);
    orch.poll_updates();
    let done = updates_for(&mut rx, &task.id).pop().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.output_path, Some(expected));
    assert!(!TaskFiles::new(dir.path(), &task.id)
        .unwrap()
        .progress_path()
        .exists());
}

#[test]
fn in_process_worker_honours_cancel_signal() {
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("clip.png");
    std::fs::write(&input, b"pixels").unwrap();

    let launcher = FakeLauncher::new();
    let mut orch = orchestrator(&dir, &launcher);
    let task = orch
        .enqueue(EnqueueRequest::image(&input, UpscaleParams::default()))
        .unwrap();
    orch.start_processing();
    orch.cancel(&task.id);

    let worker = TaskWorker::new(&task.id, dir.path(), &settings()).unwrap();
    assert_eq!(worker.run(&mut CopyProcessor), WorkerOutcome::Cancelled);

    launcher.exit(&task.id, false);
    orch.poll_updates();
    assert_eq!(orch.get_task(&task.id).unwrap().status, TaskStatus::Cancelled);
    assert!(!dir.path().join("clip_upscaled_2x.png").exists());
}
