//! # Flightdeck Core
//!
//! Orchestration for outbound async work.
//!
//! This crate contains:
//! - [`scheduler`]: a bounded-concurrency priority queue with dependencies,
//!   priority inheritance, pause/resume and metadata persistence
//! - [`resilience`]: circuit breaker, retry with backoff, polling
//! - [`single_flight`]: request deduplication and credential refresh
//!   coalescing
//! - [`connectivity`]: injectable online/offline signal
//! - [`config`]: TOML/JSON configuration with environment overrides
//!
//! ## Architecture Principles
//! - Only depends on `flightdeck-common`
//! - Shared state sits behind one lock per component, never held across an
//!   `.await`
//! - Storage and connectivity are injected through traits

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connectivity;
pub mod resilience;
pub mod scheduler;
pub mod single_flight;

pub use config::FlightdeckConfig;
pub use connectivity::{ConnectivityHub, ConnectivityMonitor, ConnectivityStatus};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ResilienceError, RetryConfig,
    RetryError, RetryExecutor,
};
pub use scheduler::{
    SchedulerConfig, SchedulerError, SchedulerEvent, TaskError, TaskHandle, TaskOptions,
    TaskScheduler,
};
pub use single_flight::{RefreshCoordinator, RequestKey, SingleFlight, SingleFlightError};

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
