//! Bounded-concurrency priority/dependency scheduler.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::Utc;
use flightdeck_common::error::CommonError;
use flightdeck_common::storage::KeyValueStore;
use flightdeck_common::{EventBus, EventSubscription};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::errors::{SchedulerError, SchedulerResult, TaskError};
use super::events::{PauseReason, SchedulerEvent};
use super::persistence::{spawn_writer, PersistenceHandle};
use super::priority::{effective_priorities, find_cycle};
use super::types::{
    DependencyFailurePolicy, SchedulerConfig, SchedulerStats, TaskMetadata, TaskOptions, TaskState,
};
use crate::connectivity::{ConnectivityMonitor, ConnectivityStatus};
use crate::panic_message;

const REASON_CANCELLED: &str = "cancelled by caller";
const REASON_CLEARED: &str = "queue cleared";
const REASON_DISPOSED: &str = "scheduler disposed";

/// How a task's operation settled.
enum Settlement {
    Succeeded,
    Failed(String),
    Panicked(String),
}

/// Why a pending task is being removed without running.
enum Rejection {
    Cancelled(&'static str),
    DependencyFailed(String),
}

enum Disposition {
    Run,
    Reject(Rejection),
}

/// Type-erased task body: either runs the operation or rejects the handle.
type Job = Box<dyn FnOnce(Disposition) -> Option<BoxFuture<'static, Settlement>> + Send>;

struct PendingTask {
    meta: TaskMetadata,
    sequence: u64,
    job: Job,
}

#[derive(Default)]
struct SchedulerState {
    concurrency_limit: usize,
    pending: HashMap<String, PendingTask>,
    active: HashSet<String>,
    completed: HashSet<String>,
    failed: HashSet<String>,
    cancelled: HashSet<String>,
    paused: bool,
    offline: bool,
    disposed: bool,
    next_sequence: u64,
    /// Set on admission, cleared when the drain notification fires.
    undrained: bool,
    /// Cached effective priorities; `None` after any structural change.
    effective: Option<HashMap<String, i64>>,
}

impl SchedulerState {
    fn admission_open(&self) -> bool {
        !self.paused && !self.offline && !self.disposed
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.active.is_empty()
    }

    fn structure_changed(&mut self) {
        self.effective = None;
    }

    fn effective_priority(&mut self, id: &str) -> i64 {
        let pending = &self.pending;
        let effective = self.effective.get_or_insert_with(|| {
            effective_priorities(pending.iter().map(|(id, task)| {
                (id.as_str(), task.meta.priority, task.meta.dependencies.as_slice())
            }))
        });
        effective.get(id).copied().unwrap_or_default()
    }

    /// Highest effective priority runnable task, earliest submission first.
    fn next_runnable(&mut self) -> Option<String> {
        let candidates: Vec<(String, u64)> = self
            .pending
            .iter()
            .filter(|(_, task)| task.meta.dependencies.iter().all(|dep| self.completed.contains(dep)))
            .map(|(id, task)| (id.clone(), task.sequence))
            .collect();

        candidates
            .into_iter()
            .map(|(id, sequence)| {
                let priority = self.effective_priority(&id);
                (priority, std::cmp::Reverse(sequence), id)
            })
            .max()
            .map(|(_, _, id)| id)
    }

    /// Remove pending tasks that (transitively) depend on a failed task.
    fn take_failed_dependents(&mut self) -> Vec<(String, Job, String)> {
        let mut doomed = Vec::new();
        loop {
            let round: Vec<(String, String)> = self
                .pending
                .iter()
                .filter_map(|(id, task)| {
                    task.meta
                        .dependencies
                        .iter()
                        .find(|dep| self.failed.contains(*dep))
                        .map(|dep| (id.clone(), dep.clone()))
                })
                .collect();
            if round.is_empty() {
                break;
            }
            for (id, dependency) in round {
                if let Some(task) = self.pending.remove(&id) {
                    self.completed.insert(id.clone());
                    self.failed.insert(id.clone());
                    doomed.push((id, task.job, dependency));
                }
            }
            self.structure_changed();
        }
        doomed
    }

    fn snapshot(&self) -> Vec<TaskMetadata> {
        let mut tasks: Vec<&PendingTask> = self.pending.values().collect();
        tasks.sort_by_key(|task| task.sequence);
        tasks.into_iter().map(|task| task.meta.clone()).collect()
    }

    fn take_drained(&mut self) -> bool {
        if self.undrained && self.is_idle() {
            self.undrained = false;
            return true;
        }
        false
    }

    fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.pending.len(),
            active: self.active.len(),
            completed: self.completed.len(),
            concurrency_limit: self.concurrency_limit,
            paused: self.paused,
            offline: self.offline,
            disposed: self.disposed,
        }
    }
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    policy: DependencyFailurePolicy,
    events: EventBus<SchedulerEvent>,
    drained: Notify,
    runtime: tokio::runtime::Handle,
    persistence: Option<PersistenceHandle>,
    restored: watch::Receiver<Option<Vec<TaskMetadata>>>,
    connectivity_listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SchedulerInner {
    fn drop(&mut self) {
        if let Some(listener) = self.connectivity_listener.get_mut().take() {
            listener.abort();
        }
    }
}

impl SchedulerInner {
    /// Must be called with the state lock held so snapshots stay ordered.
    fn persist(&self, state: &SchedulerState) {
        if let Some(persistence) = &self.persistence {
            persistence.snapshot(state.snapshot());
        }
    }

    fn reject(&self, id: String, job: Job, rejection: Rejection) {
        let event = match &rejection {
            Rejection::Cancelled(reason) => {
                SchedulerEvent::TaskCancelled { id, reason: (*reason).to_string() }
            }
            Rejection::DependencyFailed(dependency) => {
                SchedulerEvent::TaskFailed { id, error: format!("dependency '{dependency}' failed") }
            }
        };
        let _ = job(Disposition::Reject(rejection));
        self.events.publish(event);
    }

    /// Admit as many runnable tasks as capacity allows.
    fn dispatch(self: &Arc<Self>) {
        let mut doomed = Vec::new();
        let mut launches = Vec::new();
        let drained;
        {
            let mut state = self.state.lock();
            if self.policy == DependencyFailurePolicy::Cascade {
                doomed = state.take_failed_dependents();
            }

            while state.admission_open() && state.active.len() < state.concurrency_limit {
                let Some(id) = state.next_runnable() else { break };
                let effective_priority = state.effective_priority(&id);
                let Some(task) = state.pending.remove(&id) else { break };
                state.structure_changed();
                state.active.insert(id.clone());
                launches.push((id, effective_priority, task.job));
            }

            if !doomed.is_empty() || !launches.is_empty() {
                self.persist(&state);
            }
            drained = state.take_drained();
        }

        for (id, job, dependency) in doomed {
            debug!(task_id = %id, %dependency, "failing task after dependency failure");
            self.reject(id, job, Rejection::DependencyFailed(dependency));
        }

        for (id, effective_priority, job) in launches {
            debug!(task_id = %id, effective_priority, "task started");
            self.events.publish(SchedulerEvent::TaskStarted { id: id.clone(), effective_priority });
            let Some(run) = job(Disposition::Run) else { continue };
            let inner = Arc::clone(self);
            self.runtime.spawn(async move {
                let settlement = run.await;
                inner.settle(id, settlement);
            });
        }

        if drained {
            debug!("queue drained");
            self.events.publish(SchedulerEvent::QueueDrained);
            self.drained.notify_waiters();
        }
    }

    fn settle(self: &Arc<Self>, id: String, settlement: Settlement) {
        {
            let mut state = self.state.lock();
            state.active.remove(&id);
            state.completed.insert(id.clone());
            if matches!(settlement, Settlement::Succeeded) {
                state.failed.remove(&id);
            } else {
                state.failed.insert(id.clone());
            }
        }

        let event = match settlement {
            Settlement::Succeeded => {
                debug!(task_id = %id, "task completed");
                SchedulerEvent::TaskCompleted { id }
            }
            Settlement::Failed(error) => {
                warn!(task_id = %id, %error, "task failed");
                SchedulerEvent::TaskFailed { id, error }
            }
            Settlement::Panicked(message) => {
                warn!(task_id = %id, %message, "task panicked");
                SchedulerEvent::TaskFailed { id, error: format!("panicked: {message}") }
            }
        };
        self.events.publish(event);
        self.dispatch();
    }

    fn set_offline(self: &Arc<Self>, offline: bool) {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.offline != offline && !state.disposed;
            if changed {
                state.offline = offline;
            }
            changed
        };
        if !changed {
            return;
        }

        if offline {
            info!("connectivity lost; pausing admission");
            self.events.publish(SchedulerEvent::QueuePaused { reason: PauseReason::Connectivity });
        } else {
            info!("connectivity restored; resuming admission");
            self.events.publish(SchedulerEvent::QueueResumed { reason: PauseReason::Connectivity });
            self.dispatch();
        }
    }
}

/// Future resolving to a submitted task's outcome.
///
/// Dropping the handle does not cancel the task.
pub struct TaskHandle<T, E> {
    id: String,
    receiver: oneshot::Receiver<Result<T, TaskError<E>>>,
}

impl<T, E> TaskHandle<T, E> {
    /// Id the task was submitted under.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl<T, E> Future for TaskHandle<T, E> {
    type Output = Result<T, TaskError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => {
                Poll::Ready(Err(TaskError::Abandoned { task_id: self.id.clone() }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T, E> fmt::Debug for TaskHandle<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Priority and dependency aware task queue with a concurrency bound.
///
/// Tasks are opaque async operations. A task starts once admission is open
/// (not paused, not offline), a concurrency slot is free, and every id it
/// depends on has settled. Among runnable tasks the highest effective
/// priority wins; ties go to the earliest submission. A task's effective
/// priority is raised to that of anything pending that depends on it, so
/// low-priority prerequisites of urgent work are not starved.
///
/// State lives behind a single mutex that is never held across an await.
/// Every settlement, admission, resume, and limit change re-runs dispatch.
///
/// ```rust,ignore
/// let scheduler = TaskScheduler::new(SchedulerConfig::default())?;
/// let handle = scheduler.submit(TaskOptions::new().with_priority(5), || async {
///     Ok::<_, String>(42)
/// })?;
/// assert_eq!(handle.await?, 42);
/// ```
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskScheduler {
    /// Create a scheduler without persistence.
    ///
    /// Must be called from within a tokio runtime; tasks are spawned on it.
    pub fn new(config: SchedulerConfig) -> SchedulerResult<Self> {
        Self::build(config, None)
    }

    /// Create a scheduler that persists pending metadata to `store`.
    ///
    /// Metadata left by a previous scheduler under the same key is surfaced
    /// through [`TaskScheduler::restored`] and a `QueueRestored` event.
    pub fn with_store(
        config: SchedulerConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> SchedulerResult<Self> {
        Self::build(config, Some(store))
    }

    fn build(config: SchedulerConfig, store: Option<Arc<dyn KeyValueStore>>) -> SchedulerResult<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            SchedulerError::Common(CommonError::internal_with_context(
                "no tokio runtime available",
                "TaskScheduler::new",
            ))
        })?;

        let events = EventBus::new(config.event_capacity);
        let (persistence, restored) = match store {
            Some(store) => {
                let (restored_tx, restored_rx) = watch::channel(None);
                let handle = spawn_writer(
                    &runtime,
                    store,
                    config.persistence_key.clone(),
                    restored_tx,
                    events.clone(),
                );
                (Some(handle), restored_rx)
            }
            None => {
                let (_, restored_rx) = watch::channel(Some(Vec::new()));
                (None, restored_rx)
            }
        };

        info!(
            concurrency_limit = config.concurrency_limit,
            persistent = persistence.is_some(),
            policy = %config.dependency_failure_policy,
            "task scheduler created"
        );

        let state = SchedulerState { concurrency_limit: config.concurrency_limit, ..Default::default() };
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                state: Mutex::new(state),
                policy: config.dependency_failure_policy,
                events,
                drained: Notify::new(),
                runtime,
                persistence,
                restored,
                connectivity_listener: Mutex::new(None),
            }),
        })
    }

    /// Queue `operation` and return a handle to its outcome.
    ///
    /// Fails without enqueuing when the id is already pending or active,
    /// when the dependencies would close a cycle, or after disposal.
    /// Dependencies on ids that have never been submitted wait until a task
    /// with that id settles.
    #[instrument(skip_all, fields(task_id = tracing::field::Empty, priority = options.priority))]
    pub fn submit<T, E, F, Fut>(
        &self,
        options: TaskOptions,
        operation: F,
    ) -> SchedulerResult<TaskHandle<T, E>>
    where
        T: Send + 'static,
        E: fmt::Display + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let id = options.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if id.trim().is_empty() {
            return Err(CommonError::validation("id", "task id must not be empty").into());
        }
        tracing::Span::current().record("task_id", id.as_str());

        let mut dependencies: Vec<String> = Vec::with_capacity(options.dependencies.len());
        for dep in options.dependencies {
            if !dependencies.contains(&dep) {
                dependencies.push(dep);
            }
        }

        let (tx, receiver) = oneshot::channel();
        let job = make_job(id.clone(), tx, operation);

        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(SchedulerError::Disposed);
            }
            if state.pending.contains_key(&id) || state.active.contains(&id) {
                return Err(SchedulerError::DuplicateTask(id));
            }
            if let Some(path) = find_cycle(&id, &dependencies, |dep| {
                state.pending.get(dep).map(|task| task.meta.dependencies.as_slice())
            }) {
                return Err(SchedulerError::DependencyCycle { task_id: id, path });
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            state.cancelled.remove(&id);
            state.failed.remove(&id);
            let meta = TaskMetadata {
                id: id.clone(),
                priority: options.priority,
                dependencies,
                submitted_at: Utc::now(),
            };
            state.pending.insert(id.clone(), PendingTask { meta, sequence, job });
            state.structure_changed();
            state.undrained = true;
            self.inner.persist(&state);
        }

        debug!(task_id = %id, priority = options.priority, "task admitted");
        self.inner
            .events
            .publish(SchedulerEvent::TaskAdmitted { id: id.clone(), priority: options.priority });
        self.inner.dispatch();

        Ok(TaskHandle { id, receiver })
    }

    /// Remove a pending task. Returns `false` for active or unknown ids.
    pub fn cancel(&self, id: &str) -> bool {
        let task = {
            let mut state = self.inner.state.lock();
            let Some(task) = state.pending.remove(id) else { return false };
            state.cancelled.insert(id.to_string());
            state.structure_changed();
            self.inner.persist(&state);
            task
        };

        debug!(task_id = %id, "task cancelled");
        self.inner.reject(id.to_string(), task.job, Rejection::Cancelled(REASON_CANCELLED));
        self.inner.dispatch();
        true
    }

    /// Stop admitting tasks. Active tasks keep running.
    pub fn pause(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.paused, true)
        };
        if changed {
            info!("scheduler paused");
            self.inner.events.publish(SchedulerEvent::QueuePaused { reason: PauseReason::Manual });
        }
    }

    /// Resume admission and dispatch immediately.
    pub fn resume(&self) {
        let changed = {
            let mut state = self.inner.state.lock();
            std::mem::replace(&mut state.paused, false)
        };
        if changed {
            info!("scheduler resumed");
            self.inner.events.publish(SchedulerEvent::QueueResumed { reason: PauseReason::Manual });
            self.inner.dispatch();
        }
    }

    /// Discard every pending task without running it.
    ///
    /// Handles reject with `TaskError::Cancelled` ("queue cleared").
    /// Returns the number of discarded tasks.
    pub fn clear(&self) -> usize {
        let discarded = self.take_all_pending();
        let count = discarded.len();
        for (id, job) in discarded {
            self.inner.reject(id, job, Rejection::Cancelled(REASON_CLEARED));
        }
        if count > 0 {
            info!(count, "pending queue cleared");
        }
        self.inner.dispatch();
        count
    }

    fn take_all_pending(&self) -> Vec<(String, Job)> {
        let mut state = self.inner.state.lock();
        let mut tasks: Vec<(String, PendingTask)> = state.pending.drain().collect();
        tasks.sort_by_key(|(_, task)| task.sequence);
        for (id, _) in &tasks {
            state.cancelled.insert(id.clone());
        }
        state.structure_changed();
        self.inner.persist(&state);
        tasks.into_iter().map(|(id, task)| (id, task.job)).collect()
    }

    /// Change the concurrency bound. Lowering it never interrupts active
    /// tasks; it only delays new admissions.
    pub fn set_concurrency_limit(&self, limit: usize) -> SchedulerResult<()> {
        if limit == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "concurrency_limit must be greater than 0".to_string(),
            ));
        }
        self.inner.state.lock().concurrency_limit = limit;
        debug!(limit, "concurrency limit changed");
        self.inner.dispatch();
        Ok(())
    }

    /// Forget settled ids. Tasks depending on a forgotten id wait until it
    /// settles again.
    pub fn clear_completed(&self) {
        let mut state = self.inner.state.lock();
        state.completed.clear();
        state.failed.clear();
        state.cancelled.clear();
    }

    /// Current state of `id`, if the scheduler knows it.
    pub fn task_state(&self, id: &str) -> Option<TaskState> {
        let state = self.inner.state.lock();
        if state.pending.contains_key(id) {
            Some(TaskState::Pending)
        } else if state.active.contains(id) {
            Some(TaskState::Active)
        } else if state.failed.contains(id) {
            Some(TaskState::Failed)
        } else if state.completed.contains(id) {
            Some(TaskState::Completed)
        } else if state.cancelled.contains(id) {
            Some(TaskState::Cancelled)
        } else {
            None
        }
    }

    /// Metadata of pending tasks in submission order.
    pub fn pending(&self) -> Vec<TaskMetadata> {
        self.inner.state.lock().snapshot()
    }

    /// Counters and flags read under one lock.
    ///
    /// `completed` counts every settled id since the last
    /// [`clear_completed`](Self::clear_completed), failed ones included.
    pub fn stats(&self) -> SchedulerStats {
        self.inner.state.lock().stats()
    }

    /// No pending and no active tasks.
    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().is_idle()
    }

    /// Wait until the scheduler is idle.
    ///
    /// Returns immediately when already idle. Pending tasks that can never
    /// run (paused, or waiting on an id that never settles) keep this
    /// waiting.
    pub async fn drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> EventSubscription<SchedulerEvent> {
        self.inner.events.subscribe()
    }

    /// Metadata restored from the store at construction.
    ///
    /// Empty without a store. The scheduler never re-creates runnable
    /// tasks from it; callers resubmit real work with these ids.
    #[instrument(skip(self))]
    pub async fn restored(&self) -> Vec<TaskMetadata> {
        let mut restored = self.inner.restored.clone();
        let tasks = match restored.wait_for(Option::is_some).await {
            Ok(tasks) => tasks.clone().unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        tasks
    }

    /// Follow `monitor`: offline blocks admission, online re-opens it.
    ///
    /// Replaces any previously attached monitor.
    pub fn attach_connectivity(&self, monitor: Arc<dyn ConnectivityMonitor>) {
        let mut subscription = monitor.subscribe();
        self.inner.set_offline(monitor.status() == ConnectivityStatus::Offline);

        let weak: Weak<SchedulerInner> = Arc::downgrade(&self.inner);
        let listener = self.inner.runtime.spawn(async move {
            while let Some(status) = subscription.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.set_offline(status == ConnectivityStatus::Offline);
            }
        });

        if let Some(previous) = self.inner.connectivity_listener.lock().replace(listener) {
            previous.abort();
        }
    }

    /// Discard pending work, delete persisted metadata, and refuse further
    /// submissions. Active tasks run to completion. Idempotent.
    #[instrument(skip(self))]
    pub async fn dispose(&self) {
        let discarded = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            let mut tasks: Vec<(String, PendingTask)> = state.pending.drain().collect();
            tasks.sort_by_key(|(_, task)| task.sequence);
            state.structure_changed();
            tasks
        };

        let count = discarded.len();
        for (id, task) in discarded {
            self.inner.reject(id, task.job, Rejection::Cancelled(REASON_DISPOSED));
        }

        if let Some(listener) = self.inner.connectivity_listener.lock().take() {
            listener.abort();
        }
        if let Some(persistence) = &self.inner.persistence {
            persistence.purge().await;
        }

        info!(discarded = count, "task scheduler disposed");
        self.inner.dispatch();
    }
}

impl fmt::Debug for TaskScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskScheduler").field("stats", &self.stats()).finish()
    }
}

fn make_job<T, E, F, Fut>(
    task_id: String,
    tx: oneshot::Sender<Result<T, TaskError<E>>>,
    operation: F,
) -> Job
where
    T: Send + 'static,
    E: fmt::Display + Send + 'static,
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
{
    Box::new(move |disposition: Disposition| match disposition {
        Disposition::Run => Some(
            async move {
                let outcome = AssertUnwindSafe(async move { operation().await }).catch_unwind().await;
                let (settlement, result) = match outcome {
                    Ok(Ok(value)) => (Settlement::Succeeded, Ok(value)),
                    Ok(Err(err)) => (Settlement::Failed(err.to_string()), Err(TaskError::Failed(err))),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        (
                            Settlement::Panicked(message.clone()),
                            Err(TaskError::Panicked { task_id, message }),
                        )
                    }
                };
                let _ = tx.send(result);
                settlement
            }
            .boxed(),
        ),
        Disposition::Reject(rejection) => {
            let err = match rejection {
                Rejection::Cancelled(reason) => {
                    TaskError::Cancelled { task_id, reason: reason.to_string() }
                }
                Rejection::DependencyFailed(dependency) => {
                    TaskError::DependencyFailed { task_id, dependency }
                }
            };
            let _ = tx.send(Err(err));
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::connectivity::ConnectivityHub;

    fn scheduler(limit: usize) -> TaskScheduler {
        let config = SchedulerConfig::builder().concurrency_limit(limit).build().expect("valid config");
        TaskScheduler::new(config).expect("runtime available")
    }

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn record(
        log: &Arc<Mutex<Vec<String>>>,
        name: &str,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(), String>> + Send + 'static {
        let log = Arc::clone(log);
        let name = name.to_string();
        move || {
            async move {
                log.lock().push(name);
                Ok(())
            }
            .boxed()
        }
    }

    /// Validates that paused submissions run in priority order on resume.
    ///
    /// Assertions:
    /// - Order is [10, 5, 1] with a single slot.
    #[tokio::test]
    async fn test_priority_order_after_resume() {
        let scheduler = scheduler(1);
        let log = recorder();
        scheduler.pause();

        let handles: Vec<_> = [1, 5, 10]
            .into_iter()
            .map(|p| {
                scheduler
                    .submit(TaskOptions::new().with_priority(p), record(&log, &p.to_string()))
                    .expect("submitted")
            })
            .collect();
        assert_eq!(scheduler.stats().pending, 3);

        scheduler.resume();
        for handle in handles {
            assert!(handle.await.is_ok());
        }
        assert_eq!(*log.lock(), vec!["10", "5", "1"]);
    }

    /// Validates priority inheritance from a dependent to its prerequisite.
    #[tokio::test]
    async fn test_priority_inheritance_beats_unrelated_work() {
        let scheduler = scheduler(1);
        let log = recorder();
        scheduler.pause();

        let a = scheduler.submit(TaskOptions::new().with_id("a").with_priority(1), record(&log, "a"));
        let b = scheduler.submit(
            TaskOptions::new().with_id("b").with_priority(10).depends_on("a"),
            record(&log, "b"),
        );
        let c = scheduler.submit(TaskOptions::new().with_id("c").with_priority(5), record(&log, "c"));
        scheduler.resume();

        for handle in [a, b, c] {
            assert!(handle.expect("submitted").await.is_ok());
        }
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_equal_priority_runs_in_submission_order() {
        let scheduler = scheduler(1);
        let log = recorder();
        scheduler.pause();
        let handles: Vec<_> = ["first", "second", "third"]
            .into_iter()
            .map(|name| scheduler.submit(TaskOptions::new(), record(&log, name)).expect("submitted"))
            .collect();
        scheduler.resume();
        for handle in handles {
            assert!(handle.await.is_ok());
        }
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    /// Validates that duplicate ids are rejected while pending or active.
    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let scheduler = scheduler(1);
        scheduler.pause();
        let _first = scheduler.submit(TaskOptions::new().with_id("job"), || async { Ok::<_, String>(()) });
        let second = scheduler.submit(TaskOptions::new().with_id("job"), || async { Ok::<_, String>(()) });

        assert!(matches!(second, Err(SchedulerError::DuplicateTask(ref id)) if id == "job"));
        assert_eq!(scheduler.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_self_dependency_rejected() {
        let scheduler = scheduler(1);
        let result = scheduler
            .submit(TaskOptions::new().with_id("loop").depends_on("loop"), || async { Ok::<_, String>(()) });
        assert!(matches!(result, Err(SchedulerError::DependencyCycle { .. })));
        assert!(scheduler.is_idle());
    }

    /// Validates that a panicking operation rejects only its own handle.
    ///
    /// Assertions:
    /// - The panicking task resolves to `TaskError::Panicked`.
    /// - A later task still runs.
    #[tokio::test]
    async fn test_panic_is_isolated() {
        let scheduler = scheduler(1);
        let boom = scheduler
            .submit(TaskOptions::new().with_id("boom"), || async {
                if true {
                    panic!("kaboom");
                }
                Ok::<u32, String>(0)
            })
            .expect("submitted");
        let fine = scheduler.submit(TaskOptions::new(), || async { Ok::<u32, String>(7) }).expect("submitted");

        match boom.await {
            Err(TaskError::Panicked { task_id, message }) => {
                assert_eq!(task_id, "boom");
                assert!(message.contains("kaboom"));
            }
            other => panic!("expected panic outcome, got {other:?}"),
        }
        assert_eq!(fine.await.ok(), Some(7));
        assert_eq!(scheduler.task_state("boom"), Some(TaskState::Failed));
    }

    /// Validates the cascade policy fails transitive dependents.
    #[tokio::test]
    async fn test_cascade_policy_fails_dependents() {
        let config = SchedulerConfig::builder()
            .concurrency_limit(1)
            .dependency_failure_policy(DependencyFailurePolicy::Cascade)
            .build()
            .expect("valid config");
        let scheduler = TaskScheduler::new(config).expect("runtime available");
        let ran = Arc::new(AtomicUsize::new(0));
        scheduler.pause();

        let root = scheduler
            .submit(TaskOptions::new().with_id("root"), || async { Err::<(), _>("down".to_string()) })
            .expect("submitted");
        let counter = Arc::clone(&ran);
        let child = scheduler
            .submit(TaskOptions::new().with_id("child").depends_on("root"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .expect("submitted");
        let counter = Arc::clone(&ran);
        let grandchild = scheduler
            .submit(TaskOptions::new().with_id("grandchild").depends_on("child"), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), String>(())
            })
            .expect("submitted");
        scheduler.resume();

        assert!(matches!(root.await, Err(TaskError::Failed(ref e)) if e == "down"));
        assert!(matches!(child.await, Err(TaskError::DependencyFailed { ref dependency, .. }) if dependency == "root"));
        assert!(matches!(
            grandchild.await,
            Err(TaskError::DependencyFailed { ref dependency, .. }) if dependency == "child"
        ));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        tokio::time::timeout(Duration::from_secs(2), scheduler.drained()).await.expect("drained");
    }

    /// Validates that a failed id resubmitted and completed no longer counts
    /// as failed.
    ///
    /// # Test Steps
    /// 1. Run "root" to failure under the cascade policy
    /// 2. Resubmit "root" and let it succeed
    /// 3. Submit "child" depending on "root" and verify it runs
    #[tokio::test]
    async fn test_successful_resubmission_clears_failure() {
        let config = SchedulerConfig::builder()
            .concurrency_limit(1)
            .dependency_failure_policy(DependencyFailurePolicy::Cascade)
            .build()
            .expect("valid config");
        let scheduler = TaskScheduler::new(config).expect("runtime available");

        let first = scheduler
            .submit(TaskOptions::new().with_id("root"), || async { Err::<(), _>("down".to_string()) })
            .expect("submitted");
        assert!(first.await.is_err());
        assert_eq!(scheduler.task_state("root"), Some(TaskState::Failed));

        let retry = scheduler
            .submit(TaskOptions::new().with_id("root"), || async { Ok::<(), String>(()) })
            .expect("resubmitted");
        assert!(retry.await.is_ok());
        assert_eq!(scheduler.task_state("root"), Some(TaskState::Completed));

        let child = scheduler
            .submit(TaskOptions::new().with_id("child").depends_on("root"), || async {
                Ok::<_, String>("ran")
            })
            .expect("submitted");
        let outcome = tokio::time::timeout(Duration::from_secs(2), child).await.expect("child settles");
        assert_eq!(outcome.ok(), Some("ran"));
    }

    #[tokio::test]
    async fn test_unblock_policy_runs_dependents_after_failure() {
        let scheduler = scheduler(2);
        let root = scheduler
            .submit(TaskOptions::new().with_id("root"), || async { Err::<(), _>("down".to_string()) })
            .expect("submitted");
        let child = scheduler
            .submit(TaskOptions::new().depends_on("root"), || async { Ok::<_, String>("ran") })
            .expect("submitted");

        assert!(root.await.is_err());
        assert_eq!(child.await.ok(), Some("ran"));
    }

    /// Validates that dropping the scheduler without `dispose` releases its
    /// connectivity subscription.
    #[tokio::test]
    async fn test_drop_stops_connectivity_listener() {
        let hub = Arc::new(ConnectivityHub::default());
        let scheduler = scheduler(1);
        scheduler.attach_connectivity(hub.clone());
        assert_eq!(hub.subscriber_count(), 1);

        drop(scheduler);
        tokio::time::timeout(Duration::from_secs(1), async {
            while hub.subscriber_count() > 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener released");
    }

    #[tokio::test]
    async fn test_set_concurrency_limit_rejects_zero() {
        let scheduler = scheduler(1);
        assert!(matches!(
            scheduler.set_concurrency_limit(0),
            Err(SchedulerError::InvalidConfiguration(_))
        ));
        assert!(scheduler.set_concurrency_limit(3).is_ok());
        assert_eq!(scheduler.stats().concurrency_limit, 3);
    }

    #[test]
    fn test_new_without_runtime_fails() {
        let result = TaskScheduler::new(SchedulerConfig::default());
        assert!(matches!(result, Err(SchedulerError::Common(CommonError::Internal { .. }))));
    }
}
