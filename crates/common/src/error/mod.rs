//! Common error types shared by the Flightdeck crates
//!
//! The error handling system is built on three pieces:
//!
//! 1. **`CommonError`**: error patterns that show up in more than one
//!    component (configuration, persistence, serialization, cancellation,
//!    open circuits, timeouts).
//! 2. **`ErrorClassification`**: a standard interface for classifying errors
//!    by retryability, severity and criticality.
//! 3. **`ErrorSeverity`**: a single severity scale used in log records.
//!
//! ## Composition
//!
//! Component errors compose with `CommonError` instead of duplicating its
//! variants:
//!
//! ```rust,ignore
//! #[derive(Debug, Error)]
//! pub enum SchedulerError {
//!     #[error("Task id already pending or active: {0}")]
//!     DuplicateTask(String),
//!
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//! }
//!
//! impl_error_classification!(SchedulerError, Common,
//!     Self::DuplicateTask(_) => {
//!         retryable: false,
//!         severity: ErrorSeverity::Warning,
//!         critical: false,
//!     }
//! );
//! ```
//!
//! | Pattern | CommonError Variant |
//! |---------|---------------------|
//! | **Circuit Breaker** | `CircuitBreakerOpen` |
//! | **Timeouts** | `Timeout` |
//! | **Serialization** | `Serialization` |
//! | **Validation** | `Validation` |
//! | **Configuration** | `Config` |
//! | **Storage** | `Persistence` |
//! | **Cancellation** | `TaskCancelled` |
//! | **Internal** | `Internal` |

use std::fmt;
use std::time::Duration;

/// Standard result type using CommonError
pub type CommonResult<T> = Result<T, CommonError>;

/// Common error variants that appear across multiple components
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonError {
    /// Configuration-related errors
    Config { message: String, field: Option<String> },

    /// Circuit breaker is open, preventing operations
    CircuitBreakerOpen { service: String, retry_after: Option<Duration> },

    /// Serialization or deserialization errors
    Serialization { message: String, format: Option<String> },

    /// Data persistence errors (key-value store, file I/O)
    Persistence { message: String, operation: Option<String> },

    /// Timeout errors
    Timeout { operation: String, duration: Duration },

    /// Validation errors
    Validation { field: String, message: String, value: Option<String> },

    /// Internal errors that shouldn't normally occur
    Internal { message: String, context: Option<String> },

    /// Task cancellation (async)
    TaskCancelled { task_id: String, reason: Option<String> },
}

impl fmt::Display for CommonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { message, field } => {
                if let Some(field) = field {
                    write!(f, "Configuration error in field '{}': {}", field, message)
                } else {
                    write!(f, "Configuration error: {}", message)
                }
            }
            Self::CircuitBreakerOpen { service, retry_after } => {
                if let Some(retry) = retry_after {
                    write!(f, "Circuit breaker open for '{}' (retry in {:?})", service, retry)
                } else {
                    write!(f, "Circuit breaker open for '{}'", service)
                }
            }
            Self::Serialization { message, format } => {
                if let Some(format) = format {
                    write!(f, "Serialization error ({}): {}", format, message)
                } else {
                    write!(f, "Serialization error: {}", message)
                }
            }
            Self::Persistence { message, operation } => {
                if let Some(op) = operation {
                    write!(f, "Persistence error during '{}': {}", op, message)
                } else {
                    write!(f, "Persistence error: {}", message)
                }
            }
            Self::Timeout { operation, duration } => {
                write!(f, "Operation '{}' timed out after {:?}", operation, duration)
            }
            Self::Validation { field, message, value } => {
                if let Some(value) = value {
                    write!(
                        f,
                        "Validation error for field '{}' (value: '{}'): {}",
                        field, value, message
                    )
                } else {
                    write!(f, "Validation error for field '{}': {}", field, message)
                }
            }
            Self::Internal { message, context } => {
                if let Some(ctx) = context {
                    write!(f, "Internal error in '{}': {}", ctx, message)
                } else {
                    write!(f, "Internal error: {}", message)
                }
            }
            Self::TaskCancelled { task_id, reason } => {
                if let Some(reason) = reason {
                    write!(f, "Task '{}' cancelled: {}", task_id, reason)
                } else {
                    write!(f, "Task '{}' cancelled", task_id)
                }
            }
        }
    }
}

impl std::error::Error for CommonError {}

impl ErrorClassification for CommonError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::CircuitBreakerOpen { .. } | Self::Timeout { .. })
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Config { .. } => ErrorSeverity::Error,
            Self::CircuitBreakerOpen { .. } => ErrorSeverity::Warning,
            Self::Serialization { .. } => ErrorSeverity::Error,
            Self::Persistence { .. } => ErrorSeverity::Error,
            Self::Timeout { .. } => ErrorSeverity::Warning,
            Self::Validation { .. } => ErrorSeverity::Error,
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::TaskCancelled { .. } => ErrorSeverity::Info,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitBreakerOpen { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl CommonError {
    /// Create a simple configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config { message: message.into(), field: None }
    }

    /// Create a configuration error for a specific field
    pub fn config_field<S: Into<String>, F: Into<String>>(field: F, message: S) -> Self {
        Self::Config { message: message.into(), field: Some(field.into()) }
    }

    /// Create a circuit breaker error
    pub fn circuit_breaker<S: Into<String>>(service: S) -> Self {
        Self::CircuitBreakerOpen { service: service.into(), retry_after: None }
    }

    /// Create a circuit breaker error with retry timing
    pub fn circuit_breaker_with_retry<S: Into<String>>(service: S, retry_after: Duration) -> Self {
        Self::CircuitBreakerOpen { service: service.into(), retry_after: Some(retry_after) }
    }

    /// Create a serialization error with format information
    pub fn serialization_format<S: Into<String>, F: Into<String>>(format: F, message: S) -> Self {
        Self::Serialization { message: message.into(), format: Some(format.into()) }
    }

    /// Create a simple persistence error
    pub fn persistence<S: Into<String>>(message: S) -> Self {
        Self::Persistence { message: message.into(), operation: None }
    }

    /// Create a persistence error for a specific operation
    pub fn persistence_op<S: Into<String>, O: Into<String>>(operation: O, message: S) -> Self {
        Self::Persistence { message: message.into(), operation: Some(operation.into()) }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, duration: Duration) -> Self {
        Self::Timeout { operation: operation.into(), duration }
    }

    /// Create a validation error
    pub fn validation<F: Into<String>, M: Into<String>>(field: F, message: M) -> Self {
        Self::Validation { field: field.into(), message: message.into(), value: None }
    }

    /// Create a validation error with the invalid value
    pub fn validation_with_value<F: Into<String>, M: Into<String>, V: Into<String>>(
        field: F,
        message: M,
        value: V,
    ) -> Self {
        Self::Validation { field: field.into(), message: message.into(), value: Some(value.into()) }
    }

    /// Create an internal error with context
    pub fn internal_with_context<S: Into<String>, C: Into<String>>(message: S, context: C) -> Self {
        Self::Internal { message: message.into(), context: Some(context.into()) }
    }

    /// Create a task cancellation error with reason
    pub fn task_cancelled_with_reason<S: Into<String>, R: Into<String>>(
        task_id: S,
        reason: R,
    ) -> Self {
        Self::TaskCancelled { task_id: task_id.into(), reason: Some(reason.into()) }
    }
}

/// Error classification trait for consistent error handling across modules
pub trait ErrorClassification {
    /// Check if this error is retryable
    ///
    /// Retryable errors are transient: timeouts, open circuits, a store
    /// that is briefly unavailable.
    fn is_retryable(&self) -> bool;

    /// Get the error severity level
    fn severity(&self) -> ErrorSeverity;

    /// Check if this is a critical error requiring immediate attention
    fn is_critical(&self) -> bool;

    /// Get the suggested retry delay if applicable
    fn retry_after(&self) -> Option<Duration>;
}

/// Error severity levels for monitoring and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Informational, typically for debugging
    Info,
    /// Warning, should be monitored but not critical
    Warning,
    /// Error, requires attention and action
    Error,
    /// Critical, immediate action required
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// Standard conversions from common error types
impl From<serde_json::Error> for CommonError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization_format("JSON", err.to_string())
    }
}

impl From<std::io::Error> for CommonError {
    fn from(err: std::io::Error) -> Self {
        Self::persistence(err.to_string())
    }
}

impl From<toml::de::Error> for CommonError {
    fn from(err: toml::de::Error) -> Self {
        Self::serialization_format("TOML", err.to_string())
    }
}

/// Utility macro for creating error conversions from std types
///
/// ```rust,ignore
/// #[derive(Debug, thiserror::Error)]
/// pub enum MyError {
///     #[error(transparent)]
///     Common(#[from] CommonError),
/// }
///
/// impl_error_conversion!(MyError, Common);
/// ```
///
/// This generates `From<serde_json::Error>` and `From<std::io::Error>` for
/// `MyError`, both routed through `CommonError`.
#[macro_export]
macro_rules! impl_error_conversion {
    ($error_type:ty, $variant:ident) => {
        impl From<serde_json::Error> for $error_type {
            fn from(err: serde_json::Error) -> Self {
                Self::$variant($crate::error::CommonError::from(err))
            }
        }

        impl From<std::io::Error> for $error_type {
            fn from(err: std::io::Error) -> Self {
                Self::$variant($crate::error::CommonError::from(err))
            }
        }
    };
}

/// Macro to implement ErrorClassification by delegating to CommonError
///
/// ```rust,ignore
/// impl_error_classification!(MyError, Common,
///     Self::Specific(_) => {
///         retryable: false,
///         severity: ErrorSeverity::Error,
///         critical: false,
///     }
/// );
/// ```
#[macro_export]
macro_rules! impl_error_classification {
    (
        $error_type:ty,
        $common_variant:ident
        $(,
            $variant:pat => {
                retryable: $retryable:expr,
                severity: $severity:expr,
                critical: $critical:expr
                $(, retry_after: $retry_after:expr)?
                $(,)?
            }
        )*
        $(,)?
    ) => {
        impl $crate::error::ErrorClassification for $error_type {
            fn is_retryable(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_retryable(e),
                    $(
                        $variant => $retryable,
                    )*
                }
            }

            fn severity(&self) -> $crate::error::ErrorSeverity {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::severity(e),
                    $(
                        $variant => $severity,
                    )*
                }
            }

            fn is_critical(&self) -> bool {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::is_critical(e),
                    $(
                        $variant => $critical,
                    )*
                }
            }

            fn retry_after(&self) -> Option<std::time::Duration> {
                match self {
                    Self::$common_variant(e) => $crate::error::ErrorClassification::retry_after(e),
                    $(
                        $(
                            $variant => $retry_after,
                        )?
                    )*
                    #[allow(unreachable_patterns)]
                    _ => None,
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    //! Unit tests for error handling functionality
    //!
    //! Tests cover constructors, display formatting, severity levels,
    //! retryability, the classification macro and std conversions.

    use thiserror::Error;

    use super::*;

    #[test]
    fn test_error_config_simple() {
        let err = CommonError::config("invalid configuration");
        assert_eq!(err.to_string(), "Configuration error: invalid configuration");
        assert!(!err.is_retryable());
        assert!(!err.is_critical());
        assert_eq!(err.severity(), ErrorSeverity::Error);
    }

    #[test]
    fn test_error_config_with_field() {
        let err = CommonError::config_field("concurrency_limit", "must be greater than 0");
        assert_eq!(
            err.to_string(),
            "Configuration error in field 'concurrency_limit': must be greater than 0"
        );
    }

    /// Validates that an open circuit is retryable and carries its hint.
    ///
    /// Assertions:
    /// - Ensures `err.is_retryable()` evaluates to true.
    /// - Confirms `err.retry_after()` equals `Some(Duration::from_secs(30))`.
    #[test]
    fn test_error_circuit_breaker_with_retry() {
        let err = CommonError::circuit_breaker_with_retry("billing", Duration::from_secs(30));
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(err.severity(), ErrorSeverity::Warning);
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn test_error_task_cancelled() {
        let err = CommonError::task_cancelled_with_reason("sync-7", "queue cleared");
        assert_eq!(err.to_string(), "Task 'sync-7' cancelled: queue cleared");
        assert_eq!(err.severity(), ErrorSeverity::Info);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_internal_is_critical() {
        let err = CommonError::internal_with_context("active count underflow", "dispatch");
        assert!(err.is_critical());
        assert_eq!(err.severity(), ErrorSeverity::Critical);
        assert_eq!(err.to_string(), "Internal error in 'dispatch': active count underflow");
    }

    /// Validates that every variant is reachable through a constructor and
    /// renders its own message and severity.
    #[test]
    fn test_each_variant_constructor_display_and_severity() {
        let cases = [
            (CommonError::config("bad file"), "Configuration error: bad file", ErrorSeverity::Error),
            (CommonError::circuit_breaker("ledger"), "Circuit breaker open for 'ledger'", ErrorSeverity::Warning),
            (
                CommonError::serialization_format("TOML", "eof"),
                "Serialization error (TOML): eof",
                ErrorSeverity::Error,
            ),
            (CommonError::persistence("disk full"), "Persistence error: disk full", ErrorSeverity::Error),
            (
                CommonError::timeout("fetch", Duration::from_secs(2)),
                "Operation 'fetch' timed out after 2s",
                ErrorSeverity::Warning,
            ),
            (
                CommonError::validation("id", "empty"),
                "Validation error for field 'id': empty",
                ErrorSeverity::Error,
            ),
            (
                CommonError::internal_with_context("underflow", "dispatch"),
                "Internal error in 'dispatch': underflow",
                ErrorSeverity::Critical,
            ),
            (
                CommonError::task_cancelled_with_reason("t1", "cleared"),
                "Task 't1' cancelled: cleared",
                ErrorSeverity::Info,
            ),
        ];

        for (err, message, severity) in cases {
            assert_eq!(err.to_string(), message);
            assert_eq!(err.severity(), severity);
        }
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<Vec<u32>>("[1,").unwrap_err();
        let err = CommonError::from(json_err);
        assert!(matches!(err, CommonError::Serialization { format: Some(ref f), .. } if f == "JSON"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = CommonError::from(io_err);
        assert_eq!(err.to_string(), "Persistence error: missing");
    }

    #[test]
    fn test_severity_ordering_and_display() {
        assert!(ErrorSeverity::Info < ErrorSeverity::Warning);
        assert!(ErrorSeverity::Error < ErrorSeverity::Critical);
        assert_eq!(ErrorSeverity::Warning.to_string(), "WARN");
    }

    #[derive(Debug, Error)]
    enum WidgetError {
        #[error("widget busy")]
        Busy,
        #[error("widget missing")]
        Missing,
        #[error(transparent)]
        Common(#[from] CommonError),
    }

    crate::impl_error_conversion!(WidgetError, Common);

    crate::impl_error_classification!(WidgetError, Common,
        Self::Busy => {
            retryable: true,
            severity: ErrorSeverity::Warning,
            critical: false,
            retry_after: Some(Duration::from_millis(25)),
        },
        Self::Missing => {
            retryable: false,
            severity: ErrorSeverity::Info,
            critical: false,
        }
    );

    /// Validates the classification macro for local and delegated variants.
    #[test]
    fn test_impl_error_classification_macro() {
        assert!(WidgetError::Busy.is_retryable());
        assert_eq!(WidgetError::Busy.retry_after(), Some(Duration::from_millis(25)));
        assert_eq!(WidgetError::Missing.retry_after(), None);
        assert_eq!(WidgetError::Missing.severity(), ErrorSeverity::Info);

        let delegated = WidgetError::Common(CommonError::internal_with_context("boom", "widget"));
        assert!(delegated.is_critical());
    }

    #[test]
    fn test_impl_error_conversion_macro() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: WidgetError = io_err.into();
        assert!(matches!(err, WidgetError::Common(CommonError::Persistence { .. })));
    }
}
