//! Integration tests for the task scheduler
//!
//! Covers ordering, the concurrency bound, cancellation, persistence and
//! connectivity through the public API only.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flightdeck_common::storage::{JsonFileStore, KeyValueStore, MemoryStore};
use flightdeck_core::connectivity::{ConnectivityHub, ConnectivityMonitor, ConnectivityStatus};
use flightdeck_core::scheduler::{
    PauseReason, PersistedQueue, SchedulerConfig, SchedulerError, SchedulerEvent, TaskError,
    TaskOptions, TaskScheduler, TaskState,
};
use support::{eventually, RunLog};
use tokio::sync::oneshot;

fn serial() -> SchedulerConfig {
    SchedulerConfig::builder().concurrency_limit(1).build().expect("valid config")
}

/// Validates that the number of running tasks never exceeds the limit.
///
/// # Test Steps
/// 1. Create a scheduler with a limit of 2
/// 2. Submit 8 tasks that each hold a slot for a few milliseconds
/// 3. Track the peak number running at once
/// 4. Verify the peak is 2 and every task completed
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_active_count_never_exceeds_limit() {
    let scheduler = TaskScheduler::new(
        SchedulerConfig::builder().concurrency_limit(2).build().expect("valid config"),
    )
    .expect("scheduler");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for n in 0..8 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let handle = scheduler
            .submit(TaskOptions::new().with_id(format!("job-{n}")), move || async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, String>(n)
            })
            .expect("submitted");
        handles.push(handle);
    }

    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.await.expect("task succeeds"), n);
    }
    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(scheduler.stats().completed, 8);
}

/// Validates priority order after resuming a paused queue.
#[tokio::test]
async fn test_paused_submissions_run_by_priority() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let log = RunLog::new();
    scheduler.pause();

    let handles: Vec<_> = [("low", 1), ("mid", 5), ("high", 10)]
        .into_iter()
        .map(|(id, priority)| {
            scheduler
                .submit(TaskOptions::new().with_id(id).with_priority(priority), log.task(id))
                .expect("submitted")
        })
        .collect();

    scheduler.resume();
    for handle in handles {
        handle.await.expect("task succeeds");
    }
    assert_eq!(log.entries(), vec!["high", "mid", "low"]);
}

/// Validates that a blocking low-priority prerequisite runs before
/// unrelated medium-priority work.
#[tokio::test]
async fn test_priority_inheritance_unblocks_urgent_work() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let log = RunLog::new();
    scheduler.pause();

    let a = scheduler
        .submit(TaskOptions::new().with_id("a").with_priority(1), log.task("a"))
        .expect("a");
    let b = scheduler
        .submit(TaskOptions::new().with_id("b").with_priority(10).depends_on("a"), log.task("b"))
        .expect("b");
    let c = scheduler
        .submit(TaskOptions::new().with_id("c").with_priority(5), log.task("c"))
        .expect("c");

    scheduler.resume();
    let _ = tokio::join!(a, b, c);
    assert_eq!(log.entries(), vec!["a", "b", "c"]);
}

/// Validates that only pending tasks are cancellable.
///
/// Assertions:
/// - Cancelling the active task returns false and it still completes.
/// - Cancelling the queued task returns true and its handle is Cancelled.
#[tokio::test]
async fn test_cancel_pending_but_not_active() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let slow = scheduler
        .submit(TaskOptions::new().with_id("slow"), move || async move {
            let _ = release_rx.await;
            Ok::<_, String>("slow done")
        })
        .expect("slow");
    let queued = scheduler
        .submit(TaskOptions::new().with_id("queued"), || async { Ok::<_, String>("never") })
        .expect("queued");

    assert!(eventually(|| scheduler.task_state("slow") == Some(TaskState::Active)).await);
    assert!(!scheduler.cancel("slow"));
    assert!(scheduler.cancel("queued"));
    assert!(!scheduler.cancel("queued"));

    match queued.await {
        Err(TaskError::Cancelled { task_id, .. }) => assert_eq!(task_id, "queued"),
        other => panic!("expected cancellation, got {other:?}"),
    }

    let _ = release_tx.send(());
    assert_eq!(slow.await.expect("slow completes"), "slow done");
    assert_eq!(scheduler.task_state("queued"), Some(TaskState::Cancelled));
}

#[tokio::test]
async fn test_duplicate_ids_and_cycles_rejected() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    scheduler.pause();

    let _first = scheduler
        .submit(TaskOptions::new().with_id("a").depends_on("b"), || async { Ok::<_, String>(()) })
        .expect("a");

    let duplicate =
        scheduler.submit(TaskOptions::new().with_id("a"), || async { Ok::<_, String>(()) });
    assert!(matches!(duplicate, Err(SchedulerError::DuplicateTask(ref id)) if id == "a"));

    let cycle = scheduler
        .submit(TaskOptions::new().with_id("b").depends_on("a"), || async { Ok::<_, String>(()) });
    match cycle {
        Err(SchedulerError::DependencyCycle { task_id, path }) => {
            assert_eq!(task_id, "b");
            assert_eq!(path, vec!["b", "a", "b"]);
        }
        other => panic!("expected cycle rejection, got {other:?}"),
    }
    assert_eq!(scheduler.pending().len(), 1);
}

/// Validates the persistence lifecycle against an in-memory store.
///
/// # Test Steps
/// 1. Submit two tasks to a paused scheduler backed by a store
/// 2. Wait for the pending metadata to be written
/// 3. Start a second scheduler on the same store and read `restored()`
/// 4. Dispose it and verify the stored document is deleted
#[tokio::test]
async fn test_persist_restore_and_dispose() {
    let store = Arc::new(MemoryStore::new());
    let config = serial();
    let key = config.persistence_key.clone();

    {
        let scheduler =
            TaskScheduler::with_store(config.clone(), store.clone()).expect("scheduler");
        scheduler.pause();
        for (id, priority) in [("sync-inbox", 3), ("sync-outbox", 7)] {
            scheduler
                .submit(TaskOptions::new().with_id(id).with_priority(priority), || async {
                    Ok::<_, String>(())
                })
                .expect("submitted");
        }

        let persisted = eventually(|| {
            store
                .peek(&key)
                .and_then(|json| PersistedQueue::from_json(&json).ok())
                .is_some_and(|queue| queue.tasks.len() == 2)
        })
        .await;
        assert!(persisted);
    }

    let successor = TaskScheduler::with_store(config, store.clone()).expect("successor");
    let restored = successor.restored().await;
    let ids: Vec<&str> = restored.iter().map(|meta| meta.id.as_str()).collect();
    assert_eq!(ids, vec!["sync-inbox", "sync-outbox"]);
    assert_eq!(restored[1].priority, 7);
    assert!(successor.pending().is_empty());

    successor.dispose().await;
    assert_eq!(store.peek(&key), None);

    let refused = successor.submit(TaskOptions::new(), || async { Ok::<_, String>(()) });
    assert!(matches!(refused, Err(SchedulerError::Disposed)));
}

#[tokio::test]
async fn test_restore_from_file_store() {
    let dir = tempfile::tempdir().expect("temp dir");
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(dir.path()));
    let config = serial();

    {
        let scheduler = TaskScheduler::with_store(config.clone(), Arc::clone(&store)).expect("scheduler");
        scheduler.pause();
        scheduler
            .submit(TaskOptions::new().with_id("upload"), || async { Ok::<_, String>(()) })
            .expect("submitted");

        let mut written = false;
        for _ in 0..400 {
            if let Ok(Some(json)) = store.get(&config.persistence_key).await {
                written = PersistedQueue::from_json(&json).map(|q| q.tasks.len() == 1).unwrap_or(false);
                if written {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(written);
    }

    let successor = TaskScheduler::with_store(config, store).expect("successor");
    let restored = successor.restored().await;
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].id, "upload");
}

#[tokio::test]
async fn test_dispose_rejects_pending_handles() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    scheduler.pause();
    let handle = scheduler
        .submit(TaskOptions::new().with_id("parked"), || async { Ok::<_, String>(()) })
        .expect("submitted");

    scheduler.dispose().await;
    scheduler.dispose().await;

    assert!(matches!(handle.await, Err(TaskError::Cancelled { .. })));
    assert!(scheduler.stats().disposed);
}

/// Validates that going offline holds admission and going online resumes it.
#[tokio::test]
async fn test_connectivity_gates_admission() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let hub = Arc::new(ConnectivityHub::default());
    let mut events = scheduler.subscribe();
    scheduler.attach_connectivity(hub.clone());

    hub.publish(ConnectivityStatus::Offline);
    assert!(eventually(|| scheduler.stats().offline).await);

    let log = RunLog::new();
    let handle = scheduler.submit(TaskOptions::new().with_id("report"), log.task("report")).expect("submitted");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(scheduler.task_state("report"), Some(TaskState::Pending));
    assert!(log.entries().is_empty());

    hub.publish(ConnectivityStatus::Online);
    assert_eq!(handle.await.expect("runs once online"), "report");

    let seen = events.drain();
    assert!(seen.contains(&SchedulerEvent::QueuePaused { reason: PauseReason::Connectivity }));
    assert!(seen.contains(&SchedulerEvent::QueueResumed { reason: PauseReason::Connectivity }));
}

#[tokio::test]
async fn test_monitor_already_offline_at_attach() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let hub: Arc<dyn ConnectivityMonitor> = Arc::new(ConnectivityHub::new(ConnectivityStatus::Offline));
    scheduler.attach_connectivity(Arc::clone(&hub));
    assert!(scheduler.stats().offline);

    hub.publish(ConnectivityStatus::Online);
    assert!(eventually(|| !scheduler.stats().offline).await);
}

/// Validates `drained()` and the single `QueueDrained` event per busy period.
#[tokio::test]
async fn test_drained_after_work_settles() {
    let scheduler = TaskScheduler::new(SchedulerConfig::default()).expect("scheduler");
    let mut events = scheduler.subscribe();

    scheduler.drained().await;

    for n in 0..3 {
        let _ = scheduler
            .submit(TaskOptions::new(), move || async move {
                tokio::time::sleep(Duration::from_millis(2 * n)).await;
                Ok::<_, String>(())
            })
            .expect("submitted");
    }
    scheduler.drained().await;
    assert!(scheduler.is_idle());

    tokio::task::yield_now().await;
    let drained = events.drain().into_iter().filter(|e| *e == SchedulerEvent::QueueDrained).count();
    assert_eq!(drained, 1);
}

#[tokio::test]
async fn test_failing_task_does_not_stop_queue() {
    let scheduler = TaskScheduler::new(serial()).expect("scheduler");
    let failing = scheduler
        .submit(TaskOptions::new().with_id("broken").with_priority(5), || async {
            Err::<(), _>("disk full".to_string())
        })
        .expect("submitted");
    let next = scheduler
        .submit(TaskOptions::new().with_id("next"), || async { Ok::<_, String>(1) })
        .expect("submitted");

    match failing.await {
        Err(TaskError::Failed(message)) => assert_eq!(message, "disk full"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(next.await.expect("queue continues"), 1);
    assert_eq!(scheduler.task_state("broken"), Some(TaskState::Failed));
}
