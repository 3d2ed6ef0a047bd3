//! Observability primitives
//!
//! - [`events`]: typed broadcast subscriptions for component notifications
//! - [`logging`]: `tracing-subscriber` initialisation
//!
//! Components publish advisory notifications (scheduler transitions, circuit
//! state changes, refresh outcomes) through an [`EventBus`]. Delivery never
//! blocks the publisher and a slow subscriber only loses its own backlog.

pub mod events;
pub mod logging;

pub use events::{EventBus, EventSubscription, DEFAULT_EVENT_CAPACITY};
pub use logging::{init, init_for_tests, LogFormat};
