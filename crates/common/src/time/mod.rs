//! Time abstractions
//!
//! Components that make decisions based on elapsed time (the circuit
//! breaker's reset window, retry deadlines) read time through [`Clock`] so
//! tests can drive it with [`MockClock`] instead of sleeping.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use flightdeck_common::time::{Clock, MockClock};
//!
//! let clock = MockClock::new();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(5));
//! assert_eq!(clock.now().duration_since(start), Duration::from_secs(5));
//! ```

pub mod clock;

pub use clock::{Clock, MockClock, SystemClock};
