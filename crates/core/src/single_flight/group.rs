use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use flightdeck_common::error::CommonError;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use super::errors::{Outcome, SingleFlightError};
use crate::panic_message;

type Waiters<T, E> = Vec<oneshot::Sender<Outcome<T, E>>>;

/// Deduplicates concurrent calls that share a key.
///
/// The first caller for a key spawns the operation; callers arriving while it
/// runs attach to it and receive a clone of the same outcome. The entry is
/// removed when the operation settles, so the next call starts fresh.
/// Dropping a caller's future detaches only that caller.
pub struct SingleFlight<K, T, E> {
    flights: Arc<DashMap<K, Waiters<T, E>>>,
}

impl<K, T, E> Clone for SingleFlight<K, T, E> {
    fn clone(&self) -> Self {
        Self { flights: Arc::clone(&self.flights) }
    }
}

impl<K, T, E> Default for SingleFlight<K, T, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self { flights: Arc::new(DashMap::new()) }
    }
}

impl<K, T, E> fmt::Debug for SingleFlight<K, T, E>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleFlight").field("in_flight", &self.flights.len()).finish()
    }
}

impl<K, T, E> SingleFlight<K, T, E>
where
    K: Eq + Hash + Clone + fmt::Display + Send + Sync + 'static,
    T: Clone + Send + 'static,
    E: fmt::Display + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `operation` under `key`, or join the run already in flight.
    ///
    /// `operation` is only invoked when no run for `key` is outstanding.
    #[instrument(skip_all, fields(key = %key))]
    pub async fn run<F, Fut>(&self, key: K, operation: F) -> Result<T, SingleFlightError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        let start = match self.flights.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(tx);
                debug!(waiters = entry.get().len(), "joined in-flight operation");
                None
            }
            Entry::Vacant(entry) => {
                let runtime = Handle::try_current().map_err(|e| {
                    CommonError::internal_with_context(e.to_string(), "single_flight")
                })?;
                entry.insert(vec![tx]);
                Some(runtime)
            }
        };

        if let Some(runtime) = start {
            let future = match std::panic::catch_unwind(AssertUnwindSafe(operation)) {
                Ok(future) => future,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    warn!(key = %key, panic = %message, "coalesced operation panicked before starting");
                    settle(&self.flights, &key, Err(SingleFlightError::Panicked { message }));
                    return rx.await.unwrap_or(Err(SingleFlightError::Abandoned));
                }
            };
            let flights = Arc::clone(&self.flights);
            let key = key.clone();
            runtime.spawn(async move {
                let outcome = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(error)) => {
                        warn!(key = %key, error = %error, "coalesced operation failed");
                        Err(SingleFlightError::Operation(Arc::new(error)))
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!(key = %key, panic = %message, "coalesced operation panicked");
                        Err(SingleFlightError::Panicked { message })
                    }
                };
                settle(&flights, &key, outcome);
            });
        }

        rx.await.unwrap_or(Err(SingleFlightError::Abandoned))
    }

    /// Number of keys with an operation outstanding.
    pub fn in_flight(&self) -> usize {
        self.flights.len()
    }

    /// Whether an operation for `key` is outstanding right now.
    pub fn is_in_flight(&self, key: &K) -> bool {
        self.flights.contains_key(key)
    }
}

/// Remove the entry for `key` and hand `outcome` to everyone attached to it.
fn settle<K, T, E>(flights: &DashMap<K, Waiters<T, E>>, key: &K, outcome: Outcome<T, E>)
where
    K: Eq + Hash + fmt::Display,
    T: Clone,
    E: fmt::Display,
{
    let waiters = flights.remove(key).map(|(_, waiters)| waiters).unwrap_or_default();
    debug!(key = %key, waiters = waiters.len(), "single-flight settled");
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}
