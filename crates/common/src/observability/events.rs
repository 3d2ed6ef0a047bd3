//! Typed event bus built on `tokio::sync::broadcast`.

use std::fmt;

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Default number of buffered events per bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Broadcast channel for one event type.
///
/// Publishing with no subscribers is not an error; the event is dropped.
///
/// ```rust
/// # tokio_test::block_on(async {
/// use flightdeck_common::observability::EventBus;
///
/// let bus: EventBus<&'static str> = EventBus::new(8);
/// let mut sub = bus.subscribe();
/// bus.publish("drained");
/// assert_eq!(sub.recv().await, Some("drained"));
/// # });
/// ```
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event, returning how many subscribers will observe it.
    pub fn publish(&self, event: E) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> EventSubscription<E> {
        EventSubscription { receiver: self.sender.subscribe() }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone + Send + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone() }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus").field("subscribers", &self.sender.receiver_count()).finish()
    }
}

/// Receiving half of an [`EventBus`].
///
/// A subscription that falls behind skips the events it missed and keeps
/// receiving newer ones.
pub struct EventSubscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone + Send + 'static> EventSubscription<E> {
    /// Wait for the next event; `None` once every publisher is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping missed events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping missed events");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every buffered event.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

impl<E> fmt::Debug for EventSubscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSubscription").field("buffered", &self.receiver.len()).finish()
    }
}
