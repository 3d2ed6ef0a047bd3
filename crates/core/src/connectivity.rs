//! Network reachability as an injected dependency.
//!
//! Components that react to connectivity take an
//! `Arc<dyn ConnectivityMonitor>`; whoever owns the platform signal
//! publishes into it. [`ConnectivityHub`] is the in-process implementation.

use flightdeck_common::impl_status_conversions;
use flightdeck_common::{EventBus, EventSubscription};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityStatus {
    #[default]
    Online,
    Offline,
}

impl_status_conversions!(ConnectivityStatus {
    Online => "online",
    Offline => "offline",
});

/// Source of connectivity changes.
pub trait ConnectivityMonitor: Send + Sync {
    /// Last published status.
    fn status(&self) -> ConnectivityStatus;

    /// Receive every status change published after this call.
    fn subscribe(&self) -> EventSubscription<ConnectivityStatus>;

    /// Record a new status; subscribers are notified only on change.
    fn publish(&self, status: ConnectivityStatus);
}

/// In-process [`ConnectivityMonitor`].
#[derive(Debug)]
pub struct ConnectivityHub {
    status: Mutex<ConnectivityStatus>,
    events: EventBus<ConnectivityStatus>,
}

impl ConnectivityHub {
    pub fn new(initial: ConnectivityStatus) -> Self {
        Self { status: Mutex::new(initial), events: EventBus::new(16) }
    }

    /// Number of live subscriptions to status changes.
    pub fn subscriber_count(&self) -> usize {
        self.events.subscriber_count()
    }
}

impl Default for ConnectivityHub {
    fn default() -> Self {
        Self::new(ConnectivityStatus::Online)
    }
}

impl ConnectivityMonitor for ConnectivityHub {
    fn status(&self) -> ConnectivityStatus {
        *self.status.lock()
    }

    fn subscribe(&self) -> EventSubscription<ConnectivityStatus> {
        self.events.subscribe()
    }

    fn publish(&self, status: ConnectivityStatus) {
        let previous = std::mem::replace(&mut *self.status.lock(), status);
        if previous != status {
            info!(from = %previous, to = %status, "connectivity changed");
            self.events.publish(status);
        }
    }
}
