use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use flightdeck_common::error::CommonError;
use flightdeck_common::{EventBus, EventSubscription};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument, warn};

use super::errors::{RecoveryError, RefreshError};
use crate::panic_message;

/// Lifecycle of one coalesced refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshEvent {
    Started,
    /// `waiters` counts every caller that received the credential.
    Succeeded { waiters: usize },
    Failed { waiters: usize },
}

/// A request that may be replayed once after a credential refresh.
pub trait Replayable {
    fn is_retried(&self) -> bool;
    fn mark_retried(&mut self);
}

/// Wraps any request with a retried flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tracked<R> {
    pub request: R,
    retried: bool,
}

impl<R> Tracked<R> {
    pub fn new(request: R) -> Self {
        Self { request, retried: false }
    }

    pub fn into_inner(self) -> R {
        self.request
    }
}

impl<R> Replayable for Tracked<R> {
    fn is_retried(&self) -> bool {
        self.retried
    }

    fn mark_retried(&mut self) {
        self.retried = true;
    }
}

type Waiter<C, E> = oneshot::Sender<Result<C, RefreshError<E>>>;

/// Collapses concurrent credential refreshes into one.
///
/// While a refresh is outstanding, further callers queue in arrival order and
/// all of them receive its outcome. The queue is emptied the moment the
/// refresh settles, whether it succeeded, failed or panicked.
pub struct RefreshCoordinator<C, E> {
    waiters: Arc<Mutex<Option<Vec<Waiter<C, E>>>>>,
    events: EventBus<RefreshEvent>,
}

impl<C, E> Clone for RefreshCoordinator<C, E> {
    fn clone(&self) -> Self {
        Self { waiters: Arc::clone(&self.waiters), events: self.events.clone() }
    }
}

impl<C, E> fmt::Debug for RefreshCoordinator<C, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queued = self.waiters.lock().as_ref().map(Vec::len);
        f.debug_struct("RefreshCoordinator").field("queued", &queued).finish()
    }
}

impl<C, E> Default for RefreshCoordinator<C, E> {
    fn default() -> Self {
        Self { waiters: Arc::new(Mutex::new(None)), events: EventBus::new(32) }
    }
}

impl<C, E> RefreshCoordinator<C, E>
where
    C: Clone + Send + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a refresh is outstanding.
    pub fn is_refreshing(&self) -> bool {
        self.waiters.lock().is_some()
    }

    /// Subscribe to refresh lifecycle events.
    pub fn subscribe(&self) -> EventSubscription<RefreshEvent> {
        self.events.subscribe()
    }

    /// Obtain a fresh credential, starting `operation` only if no refresh is
    /// already outstanding.
    #[instrument(skip_all)]
    pub async fn refresh<F, Fut>(&self, operation: F) -> Result<C, RefreshError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let runtime = {
            let mut waiters = self.waiters.lock();
            match waiters.as_mut() {
                Some(queue) => {
                    queue.push(tx);
                    debug!(queued = queue.len(), "joined outstanding refresh");
                    None
                }
                None => {
                    let runtime = Handle::try_current().map_err(|e| {
                        CommonError::internal_with_context(e.to_string(), "refresh_coordinator")
                    })?;
                    *waiters = Some(vec![tx]);
                    Some(runtime)
                }
            }
        };

        if let Some(runtime) = runtime {
            info!("starting credential refresh");
            self.events.publish(RefreshEvent::Started);
            let future = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
                Ok(future) => future,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    settle(&self.waiters, &self.events, Err(RefreshError::Panicked { message }));
                    return rx.await.unwrap_or(Err(RefreshError::Abandoned));
                }
            };
            let waiters = Arc::clone(&self.waiters);
            let events = self.events.clone();
            runtime.spawn(async move {
                let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(credential)) => Ok(credential),
                    Ok(Err(error)) => Err(RefreshError::Failed(Arc::new(error))),
                    Err(payload) => {
                        Err(RefreshError::Panicked { message: panic_message(payload.as_ref()) })
                    }
                };
                settle(&waiters, &events, outcome);
            });
        }

        rx.await.unwrap_or(Err(RefreshError::Abandoned))
    }

    /// Recover a request that failed for lack of a valid credential.
    ///
    /// A request is replayed at most once: one already marked retried is
    /// rejected with [`RecoveryError::AlreadyRetried`] without refreshing.
    pub async fn recover<R, F, Fut, G, GFut, T, RE>(
        &self,
        mut request: R,
        refresh: F,
        replay: G,
    ) -> Result<T, RecoveryError<E, RE>>
    where
        R: Replayable,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>> + Send + 'static,
        G: FnOnce(R, C) -> GFut,
        GFut: Future<Output = Result<T, RE>>,
    {
        if request.is_retried() {
            debug!("request already replayed once; not refreshing again");
            return Err(RecoveryError::AlreadyRetried);
        }

        let credential = self.refresh(refresh).await?;
        request.mark_retried();
        replay(request, credential).await.map_err(RecoveryError::Replay)
    }
}

/// Empty the queue and deliver `outcome` to every queued caller.
fn settle<C, E>(
    waiters: &Mutex<Option<Vec<Waiter<C, E>>>>,
    events: &EventBus<RefreshEvent>,
    outcome: Result<C, RefreshError<E>>,
) where
    C: Clone,
    E: fmt::Display,
{
    let queue = waiters.lock().take().unwrap_or_default();
    let count = queue.len();
    match &outcome {
        Ok(_) => {
            info!(waiters = count, "credential refresh succeeded");
            events.publish(RefreshEvent::Succeeded { waiters: count });
        }
        Err(error) => {
            warn!(waiters = count, error = %error, "credential refresh failed");
            events.publish(RefreshEvent::Failed { waiters: count });
        }
    }
    for waiter in queue {
        let _ = waiter.send(outcome.clone());
    }
}
