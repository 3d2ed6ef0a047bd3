//! Scheduler data types.

use chrono::{DateTime, Utc};
use flightdeck_common::impl_status_conversions;
use flightdeck_common::observability::DEFAULT_EVENT_CAPACITY;
use serde::{Deserialize, Serialize};

use super::errors::{SchedulerError, SchedulerResult};

/// Default maximum number of concurrently active tasks.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 4;

/// Default store key for persisted pending metadata.
pub const DEFAULT_PERSISTENCE_KEY: &str = "flightdeck.scheduler.pending";

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for capacity or dependencies
    Pending,
    /// Operation is running
    Active,
    /// Operation settled successfully
    Completed,
    /// Removed before it ran
    Cancelled,
    /// Operation failed, panicked, or was skipped by a failed dependency
    Failed,
}

impl_status_conversions!(TaskState {
    Pending => "pending",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
    Failed => "failed",
});

/// What a failed dependency means for the tasks waiting on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyFailurePolicy {
    /// The failed task counts as completed; dependents become runnable.
    #[default]
    Unblock,
    /// Dependents (transitively) fail with `TaskError::DependencyFailed`.
    Cascade,
}

impl_status_conversions!(DependencyFailurePolicy {
    Unblock => "unblock",
    Cascade => "cascade",
});

/// Submission options for a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOptions {
    /// Caller-chosen id; a UUID v4 is generated when absent.
    pub id: Option<String>,
    /// Higher runs first.
    pub priority: i64,
    /// Ids that must complete before this task may start.
    pub dependencies: Vec<String>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Add one prerequisite id. Duplicates are ignored at submission.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }
}

/// Serializable description of a pending task.
///
/// This is what gets persisted and restored; the operation itself never is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub id: String,
    pub priority: i64,
    pub dependencies: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Runtime scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Maximum number of simultaneously active tasks
    pub concurrency_limit: usize,
    /// Store key used for pending metadata
    pub persistence_key: String,
    /// Effect of a failed dependency on its dependents
    pub dependency_failure_policy: DependencyFailurePolicy,
    /// Per-subscriber event buffer
    pub event_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            persistence_key: DEFAULT_PERSISTENCE_KEY.to_string(),
            dependency_failure_policy: DependencyFailurePolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SchedulerConfig {
    /// Start from the defaults: four slots, unblock policy.
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    /// Reject configurations the scheduler cannot run with.
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.concurrency_limit == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "concurrency_limit must be greater than 0".to_string(),
            ));
        }
        if self.persistence_key.trim().is_empty() {
            return Err(SchedulerError::InvalidConfiguration(
                "persistence_key must not be empty".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(SchedulerError::InvalidConfiguration(
                "event_capacity must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SchedulerConfig`].
#[derive(Debug, Clone, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    #[must_use]
    pub fn persistence_key(mut self, key: impl Into<String>) -> Self {
        self.config.persistence_key = key.into();
        self
    }

    #[must_use]
    pub fn dependency_failure_policy(mut self, policy: DependencyFailurePolicy) -> Self {
        self.config.dependency_failure_policy = policy;
        self
    }

    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> SchedulerResult<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Point-in-time view of scheduler counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
    pub concurrency_limit: usize,
    pub paused: bool,
    pub offline: bool,
    pub disposed: bool,
}
