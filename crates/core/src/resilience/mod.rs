//! Resilience patterns
//!
//! - **[`circuit_breaker`]**: fail fast while a dependency is unhealthy
//! - **[`retry`]**: re-run transient failures with backoff and jitter
//! - **[`poll`]**: check until a condition holds, under a deadline
//!
//! ## Usage
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use std::time::Duration;
//!
//! use flightdeck_core::resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, Jitter, RetryConfig, RetryExecutor,
//! };
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap().named("inventory");
//! let retry = RetryExecutor::new(
//!     RetryConfig::builder()
//!         .max_attempts(3)
//!         .initial_delay(Duration::from_millis(1))
//!         .jitter(Jitter::None)
//!         .build()
//!         .unwrap(),
//! )
//! .unwrap();
//!
//! let outcome = retry
//!     .execute(|| breaker.execute(|| async { Ok::<_, std::io::Error>(42) }))
//!     .await
//!     .unwrap();
//! assert_eq!(outcome.value, 42);
//! # });
//! ```

pub mod circuit_breaker;
pub mod poll;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerConfigBuilder, CircuitBreakerMetrics,
    CircuitEvent, CircuitState, ResilienceError, ResilienceResult,
};
pub use poll::{poll_until, PollConfig, PollError};
pub use retry::{
    policies, retry_with_policy, with_retry, BackoffStrategy, Jitter, Retried, RetryConfig,
    RetryConfigBuilder, RetryError, RetryExecutor, RetryPolicy,
};
