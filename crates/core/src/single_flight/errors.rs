use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flightdeck_common::error::{CommonError, ErrorClassification, ErrorSeverity};
use thiserror::Error;

/// Outcome delivered to every caller attached to one flight.
pub(crate) type Outcome<T, E> = Result<T, SingleFlightError<E>>;

/// Failure shared by every caller of a coalesced operation.
#[derive(Debug, Error)]
pub enum SingleFlightError<E> {
    /// The operation failed; each caller holds the same error.
    #[error("Coalesced operation failed: {0}")]
    Operation(Arc<E>),

    #[error("Coalesced operation panicked: {message}")]
    Panicked { message: String },

    /// The operation was dropped before it settled, e.g. on runtime shutdown.
    #[error("Coalesced operation was abandoned")]
    Abandoned,

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl<E: fmt::Display> Clone for SingleFlightError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Operation(error) => Self::Operation(Arc::clone(error)),
            Self::Panicked { message } => Self::Panicked { message: message.clone() },
            Self::Abandoned => Self::Abandoned,
            Self::Common(error) => Self::Common(error.clone()),
        }
    }
}

impl<E: fmt::Display> SingleFlightError<E> {
    /// The operation's own error, if it produced one.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}

impl<E: fmt::Display> ErrorClassification for SingleFlightError<E> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            Self::Abandoned => true,
            Self::Operation(_) | Self::Panicked { .. } => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Common(e) => e.severity(),
            Self::Panicked { .. } => ErrorSeverity::Critical,
            Self::Operation(_) | Self::Abandoned => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        match self {
            Self::Common(e) => e.is_critical(),
            Self::Panicked { .. } => true,
            _ => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Common(e) => e.retry_after(),
            _ => None,
        }
    }
}

/// Failure of a coalesced credential refresh.
#[derive(Debug, Error)]
pub enum RefreshError<E> {
    /// The refresh failed; every queued caller receives the same error.
    #[error("Refresh failed: {0}")]
    Failed(Arc<E>),

    #[error("Refresh panicked: {message}")]
    Panicked { message: String },

    #[error("Refresh was abandoned before it settled")]
    Abandoned,

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl<E: fmt::Display> Clone for RefreshError<E> {
    fn clone(&self) -> Self {
        match self {
            Self::Failed(error) => Self::Failed(Arc::clone(error)),
            Self::Panicked { message } => Self::Panicked { message: message.clone() },
            Self::Abandoned => Self::Abandoned,
            Self::Common(error) => Self::Common(error.clone()),
        }
    }
}

impl<E: fmt::Display> From<SingleFlightError<E>> for RefreshError<E> {
    fn from(error: SingleFlightError<E>) -> Self {
        match error {
            SingleFlightError::Operation(error) => Self::Failed(error),
            SingleFlightError::Panicked { message } => Self::Panicked { message },
            SingleFlightError::Abandoned => Self::Abandoned,
            SingleFlightError::Common(error) => Self::Common(error),
        }
    }
}

/// Why [`RefreshCoordinator::recover`](super::RefreshCoordinator::recover)
/// did not produce a replayed response.
#[derive(Debug, Error)]
pub enum RecoveryError<E, R> {
    /// The request was already replayed once after a refresh.
    #[error("Request was already retried after a refresh")]
    AlreadyRetried,

    #[error(transparent)]
    Refresh(#[from] RefreshError<E>),

    /// The replayed request failed.
    #[error("Replay failed: {0}")]
    Replay(R),
}
