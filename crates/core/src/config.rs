//! Configuration loading
//!
//! One [`FlightdeckConfig`] document carries a section per component. Every
//! field has a default, so an empty file is valid. Durations are integer
//! milliseconds.
//!
//! ```toml
//! [scheduler]
//! concurrency_limit = 8
//! dependency_failure_policy = "cascade"
//!
//! [circuit_breaker]
//! failure_threshold = 3
//! reset_timeout = 10000
//!
//! [retry]
//! max_attempts = 4
//! backoff = "exponential"
//! jitter = "none"
//!
//! [single_flight]
//! methods = ["GET"]
//! ```
//!
//! ## Environment Variables
//! - `FLIGHTDECK_CONCURRENCY`: scheduler concurrency limit
//! - `FLIGHTDECK_PERSISTENCE_KEY`: key for the persisted pending queue
//! - `FLIGHTDECK_FAILURE_THRESHOLD`: breaker failure threshold
//! - `FLIGHTDECK_RESET_TIMEOUT_MS`: breaker reset timeout in milliseconds
//! - `FLIGHTDECK_RETRY_MAX_ATTEMPTS`: retry attempts including the first

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use flightdeck_common::error::{CommonError, CommonResult};
use flightdeck_common::utils::serde::{duration_millis, option_duration_millis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::resilience::{BackoffStrategy, CircuitBreakerConfig, Jitter, RetryConfig};
use crate::scheduler::{
    DependencyFailurePolicy, SchedulerConfig, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_PERSISTENCE_KEY,
};

pub const ENV_CONCURRENCY: &str = "FLIGHTDECK_CONCURRENCY";
pub const ENV_PERSISTENCE_KEY: &str = "FLIGHTDECK_PERSISTENCE_KEY";
pub const ENV_FAILURE_THRESHOLD: &str = "FLIGHTDECK_FAILURE_THRESHOLD";
pub const ENV_RESET_TIMEOUT_MS: &str = "FLIGHTDECK_RESET_TIMEOUT_MS";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "FLIGHTDECK_RETRY_MAX_ATTEMPTS";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightdeckConfig {
    pub scheduler: SchedulerSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub retry: RetrySection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub single_flight: Option<SingleFlightSection>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub concurrency_limit: usize,
    pub persistence_key: String,
    pub dependency_failure_policy: DependencyFailurePolicy,
    pub event_capacity: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let defaults = SchedulerConfig::default();
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            persistence_key: DEFAULT_PERSISTENCE_KEY.to_string(),
            dependency_failure_policy: defaults.dependency_failure_policy,
            event_capacity: defaults.event_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    pub failure_threshold: u64,
    pub success_threshold: u64,
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            reset_timeout: defaults.reset_timeout,
            half_open_max_calls: defaults.half_open_max_calls,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterKind {
    None,
    Full,
    Equal,
    #[default]
    Proportional,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub backoff: BackoffKind,
    /// Growth factor for exponential backoff
    pub multiplier: f64,
    pub jitter: JitterKind,
    /// Spread for proportional jitter
    pub jitter_ratio: f64,
    #[serde(with = "option_duration_millis", skip_serializing_if = "Option::is_none")]
    pub deadline: Option<Duration>,
}

impl Default for RetrySection {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            backoff: BackoffKind::Exponential,
            multiplier: 2.0,
            jitter: JitterKind::Proportional,
            jitter_ratio: 0.1,
            deadline: defaults.deadline,
        }
    }
}

/// Which requests may be coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SingleFlightSection {
    /// HTTP methods eligible for deduplication
    pub methods: Vec<String>,
}

impl Default for SingleFlightSection {
    fn default() -> Self {
        Self { methods: vec!["GET".to_string(), "HEAD".to_string()] }
    }
}

impl SingleFlightSection {
    /// Whether requests with `method` may be coalesced. Case-insensitive.
    pub fn allows(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method.trim()))
    }
}

impl FlightdeckConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(contents: &str) -> CommonResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file, then validate.
    pub fn load_from_file(path: impl AsRef<Path>) -> CommonResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CommonError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "loading configuration from file");

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let config: Self = match extension {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            other => {
                return Err(CommonError::config(format!("Unsupported config format: {other}")))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLIGHTDECK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> CommonResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup, then validate.
    pub fn apply_overrides<L>(&mut self, lookup: L) -> CommonResult<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        if let Some(limit) = parse_var::<usize, _>(&lookup, ENV_CONCURRENCY)? {
            self.scheduler.concurrency_limit = limit;
        }
        if let Some(key) = lookup(ENV_PERSISTENCE_KEY) {
            self.scheduler.persistence_key = key;
        }
        if let Some(threshold) = parse_var::<u64, _>(&lookup, ENV_FAILURE_THRESHOLD)? {
            self.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, ENV_RESET_TIMEOUT_MS)? {
            self.circuit_breaker.reset_timeout = Duration::from_millis(millis);
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, ENV_RETRY_MAX_ATTEMPTS)? {
            self.retry.max_attempts = attempts;
        }
        self.validate()
    }

    /// Reject zero limits and thresholds and inconsistent retry delays.
    pub fn validate(&self) -> CommonResult<()> {
        self.scheduler_config()?;
        self.circuit_breaker_config()?;
        self.retry_config()?;
        Ok(())
    }

    /// Build the runtime [`SchedulerConfig`] from the `[scheduler]` section.
    ///
    /// # Errors
    ///
    /// Returns a config error prefixed with `scheduler.` for a zero limit or
    /// a blank persistence key.
    pub fn scheduler_config(&self) -> CommonResult<SchedulerConfig> {
        let section = &self.scheduler;
        if section.concurrency_limit == 0 {
            return Err(CommonError::config_field(
                "scheduler.concurrency_limit",
                "must be greater than 0",
            ));
        }
        if section.persistence_key.trim().is_empty() {
            return Err(CommonError::config_field("scheduler.persistence_key", "must not be empty"));
        }
        SchedulerConfig::builder()
            .concurrency_limit(section.concurrency_limit)
            .persistence_key(section.persistence_key.clone())
            .dependency_failure_policy(section.dependency_failure_policy)
            .event_capacity(section.event_capacity)
            .build()
            .map_err(|e| CommonError::config_field("scheduler", e.to_string()))
    }

    /// Build the runtime [`CircuitBreakerConfig`] from `[circuit_breaker]`.
    pub fn circuit_breaker_config(&self) -> CommonResult<CircuitBreakerConfig> {
        let section = &self.circuit_breaker;
        CircuitBreakerConfig::builder()
            .failure_threshold(section.failure_threshold)
            .success_threshold(section.success_threshold)
            .reset_timeout(section.reset_timeout)
            .half_open_max_calls(section.half_open_max_calls)
            .build()
    }

    /// Build the runtime [`RetryConfig`] from `[retry]`.
    ///
    /// `multiplier` only applies to exponential backoff and `jitter_ratio`
    /// only to proportional jitter.
    pub fn retry_config(&self) -> CommonResult<RetryConfig> {
        let section = &self.retry;
        let backoff = match section.backoff {
            BackoffKind::Fixed => BackoffStrategy::Fixed,
            BackoffKind::Linear => BackoffStrategy::Linear,
            BackoffKind::Exponential => {
                BackoffStrategy::Exponential { multiplier: section.multiplier }
            }
        };
        let jitter = match section.jitter {
            JitterKind::None => Jitter::None,
            JitterKind::Full => Jitter::Full,
            JitterKind::Equal => Jitter::Equal,
            JitterKind::Proportional => Jitter::Proportional(section.jitter_ratio),
        };
        let mut builder = RetryConfig::builder()
            .max_attempts(section.max_attempts)
            .initial_delay(section.initial_delay)
            .max_delay(section.max_delay)
            .backoff(backoff)
            .jitter(jitter);
        if let Some(deadline) = section.deadline {
            builder = builder.deadline(deadline);
        }
        builder.build()
    }

    /// Render the configuration as TOML, durations in milliseconds.
    pub fn to_toml_string(&self) -> CommonResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| CommonError::serialization_format("TOML", e.to_string()))
    }
}

fn parse_var<T, L>(lookup: &L, key: &str) -> CommonResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    L: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    debug!(key, "applying configuration override");
    raw.trim().parse::<T>().map(Some).map_err(|e| {
        CommonError::config_field(key, format!("invalid value '{raw}': {e}"))
    })
}
