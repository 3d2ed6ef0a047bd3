//! Scheduler notifications.

use flightdeck_common::impl_status_conversions;
use serde::Serialize;

use super::types::TaskMetadata;

/// Why admission was paused or resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PauseReason {
    /// `pause()` / `resume()`
    Manual,
    /// Connectivity monitor reported offline / online
    Connectivity,
}

impl_status_conversions!(PauseReason {
    Manual => "manual",
    Connectivity => "connectivity",
});

/// Advisory events published by [`super::TaskScheduler`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    TaskAdmitted { id: String, priority: i64 },
    TaskStarted { id: String, effective_priority: i64 },
    TaskCompleted { id: String },
    TaskFailed { id: String, error: String },
    TaskCancelled { id: String, reason: String },
    QueuePaused { reason: PauseReason },
    QueueResumed { reason: PauseReason },
    /// No pending and no active tasks remain.
    QueueDrained,
    /// Metadata read back from the store at construction.
    QueueRestored { tasks: Vec<TaskMetadata> },
}

impl SchedulerEvent {
    /// Task id the event refers to, if any.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskAdmitted { id, .. }
            | Self::TaskStarted { id, .. }
            | Self::TaskCompleted { id }
            | Self::TaskFailed { id, .. }
            | Self::TaskCancelled { id, .. } => Some(id),
            _ => None,
        }
    }
}
