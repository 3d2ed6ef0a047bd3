//! Common utility functions and helper macros
//!
//! - **[`macros`]**: `impl_status_conversions!` for lowercase status enums
//! - **[`serde`]**: Serialization helpers for configuration durations

#[macro_use]
pub mod macros;
pub mod serde;

// Re-export commonly used items for convenience
pub use self::serde::{duration_millis, option_duration_millis};
