use flightdeck_common::error::{CommonError, ErrorSeverity};
use flightdeck_common::{impl_error_classification, impl_error_conversion};
use thiserror::Error;

/// Errors returned synchronously by scheduler operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Task id already pending or active: {0}")]
    DuplicateTask(String),

    #[error("Submitting '{task_id}' would create a dependency cycle: {}", .path.join(" -> "))]
    DependencyCycle { task_id: String, path: Vec<String> },

    #[error("Scheduler has been disposed")]
    Disposed,

    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Common(#[from] CommonError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl_error_conversion!(SchedulerError, Common);

impl_error_classification!(SchedulerError, Common,
    Self::DuplicateTask(_) => {
        retryable: false,
        severity: ErrorSeverity::Warning,
        critical: false,
    },
    Self::DependencyCycle { .. } => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    },
    Self::Disposed => {
        retryable: false,
        severity: ErrorSeverity::Info,
        critical: false,
    },
    Self::InvalidConfiguration(_) => {
        retryable: false,
        severity: ErrorSeverity::Error,
        critical: false,
    }
);

/// Outcome delivered through a task handle when the task did not succeed.
#[derive(Debug, Error)]
pub enum TaskError<E> {
    /// Removed from the queue before it ran.
    #[error("Task '{task_id}' cancelled: {reason}")]
    Cancelled { task_id: String, reason: String },

    /// The operation returned an error.
    #[error("Task failed: {0}")]
    Failed(E),

    /// The operation panicked.
    #[error("Task '{task_id}' panicked: {message}")]
    Panicked { task_id: String, message: String },

    /// Skipped because a dependency failed (cascade policy).
    #[error("Task '{task_id}' skipped: dependency '{dependency}' failed")]
    DependencyFailed { task_id: String, dependency: String },

    /// The scheduler went away without settling the task.
    #[error("Task '{task_id}' was abandoned before settling")]
    Abandoned { task_id: String },
}

impl<E> TaskError<E> {
    /// Removed by `cancel`, `clear` or `dispose` before it ran.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// The operation's own error, if that is why the task failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Convert a cancellation into the shared error representation.
    pub fn to_common(&self) -> Option<CommonError> {
        match self {
            Self::Cancelled { task_id, reason } => {
                Some(CommonError::task_cancelled_with_reason(task_id.clone(), reason.clone()))
            }
            _ => None,
        }
    }
}
