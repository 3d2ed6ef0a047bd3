//! Macros for reducing boilerplate code
//!
//! Status and policy enums across the workspace render as lowercase strings in
//! logs and parse case-insensitively from configuration and environment
//! variables. This module generates that pair of impls.

/// Implements Display and FromStr traits for status enums
///
/// This macro generates:
/// - Display trait: converts enum variants to lowercase strings
/// - FromStr trait: parses case-insensitive strings to enum variants
///
/// # Example
///
/// ```rust
/// use flightdeck_common::impl_status_conversions;
///
/// #[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// pub enum LinkState {
///     Up,
///     Down,
/// }
///
/// impl_status_conversions!(LinkState {
///     Up => "up",
///     Down => "down",
/// });
///
/// assert_eq!(LinkState::Up.to_string(), "up");
/// assert_eq!("DOWN".parse::<LinkState>(), Ok(LinkState::Down));
/// ```
#[macro_export]
macro_rules! impl_status_conversions {
    ($enum_name:ident { $($variant:ident => $str:expr),+ $(,)? }) => {
        impl std::fmt::Display for $enum_name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $str),)+
                }
            }
        }

        impl std::str::FromStr for $enum_name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_lowercase().as_str() {
                    $($str => Ok(Self::$variant),)+
                    _ => Err(format!("Invalid {}: {}", stringify!($enum_name), s)),
                }
            }
        }
    };
}
