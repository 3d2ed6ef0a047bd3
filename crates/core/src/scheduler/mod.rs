//! Task scheduling
//!
//! A bounded-concurrency queue of deferred async operations:
//!
//! - **Priority**: higher runs first; equal priority runs in submission order
//! - **Dependencies**: a task starts only after every id it names has settled
//! - **Priority inheritance**: prerequisites run at the priority of their
//!   most urgent pending dependent
//! - **Persistence**: pending metadata (never the operations) can be written
//!   to a [`KeyValueStore`](flightdeck_common::storage::KeyValueStore) and
//!   surfaced again on the next start
//!
//! ## Usage
//!
//! ```rust
//! # tokio_test::block_on(async {
//! use flightdeck_core::scheduler::{SchedulerConfig, TaskOptions, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(SchedulerConfig::default()).unwrap();
//! let fetch = scheduler
//!     .submit(TaskOptions::new().with_id("fetch").with_priority(5), || async {
//!         Ok::<_, String>("payload")
//!     })
//!     .unwrap();
//! let parse = scheduler
//!     .submit(TaskOptions::new().depends_on("fetch"), || async { Ok::<_, String>(3) })
//!     .unwrap();
//!
//! assert_eq!(fetch.await.unwrap(), "payload");
//! assert_eq!(parse.await.unwrap(), 3);
//! scheduler.drained().await;
//! # });
//! ```

mod core;
pub mod errors;
pub mod events;
pub mod persistence;
pub mod priority;
pub mod types;

pub use self::core::{TaskHandle, TaskScheduler};
pub use errors::{SchedulerError, SchedulerResult, TaskError};
pub use events::{PauseReason, SchedulerEvent};
pub use persistence::PersistedQueue;
pub use types::{
    DependencyFailurePolicy, SchedulerConfig, SchedulerConfigBuilder, SchedulerStats, TaskMetadata,
    TaskOptions, TaskState, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_PERSISTENCE_KEY,
};
