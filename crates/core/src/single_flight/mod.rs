//! Request coalescing
//!
//! - **[`SingleFlight`]**: concurrent calls with the same key share one
//!   spawned operation
//! - **[`RequestKey`]**: stable key for an outbound request
//! - **[`RefreshCoordinator`]**: many callers that hit an expired credential
//!   trigger one refresh and replay their requests once
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use flightdeck_core::single_flight::{RequestKey, SingleFlight};
//!
//! let flight: SingleFlight<RequestKey, String, std::io::Error> = SingleFlight::new();
//! let key = RequestKey::new("get", "https://api.example.com/users?id=7", [("fields", "name")]).unwrap();
//! let body = flight.run(key, || async { Ok("{\"name\":\"ada\"}".to_string()) }).await.unwrap();
//! assert!(body.contains("ada"));
//! assert_eq!(flight.in_flight(), 0);
//! # });
//! ```

mod errors;
mod group;
mod key;
mod refresh;

pub use errors::{RecoveryError, RefreshError, SingleFlightError};
pub use group::SingleFlight;
pub use key::RequestKey;
pub use refresh::{RefreshCoordinator, RefreshEvent, Replayable, Tracked};
