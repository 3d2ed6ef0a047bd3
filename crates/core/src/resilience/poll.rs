//! Poll an operation until its result satisfies a condition.

use std::future::Future;
use std::time::Duration;

use flightdeck_common::error::{CommonError, CommonResult};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Polling cadence and overall budget.
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    /// Wait before the second check
    pub interval: Duration,
    /// Growth applied to the wait after each unsatisfied check
    pub multiplier: f64,
    pub max_interval: Duration,
    /// Overall budget measured from the first check
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(250),
            multiplier: 1.0,
            max_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl PollConfig {
    /// Poll every `interval` until `timeout` has elapsed.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, max_interval: interval.max(Duration::from_secs(5)), timeout, ..Self::default() }
    }

    /// Grow the interval by `multiplier` after each check, up to
    /// `max_interval`.
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.multiplier = multiplier;
        self.max_interval = max_interval;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a config error for a zero interval or timeout, or a
    /// multiplier below 1.0.
    pub fn validate(&self) -> CommonResult<()> {
        if self.interval.is_zero() {
            return Err(CommonError::config_field("interval", "must be greater than 0"));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(CommonError::config_field("multiplier", "must be at least 1.0"));
        }
        if self.timeout.is_zero() {
            return Err(CommonError::config_field("timeout", "must be greater than 0"));
        }
        Ok(())
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let next = current.as_secs_f64() * self.multiplier;
        if next.is_finite() {
            Duration::from_secs_f64(next).min(self.max_interval)
        } else {
            self.max_interval
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("Condition not met after {attempts} checks in {elapsed:?}")]
    TimedOut { attempts: u32, elapsed: Duration },

    #[error("Probe failed")]
    Operation {
        #[source]
        source: E,
        attempts: u32,
    },

    #[error(transparent)]
    Common(#[from] CommonError),
}

/// Probe `operation` until `done` accepts its value.
///
/// A check error ends polling. No wait extends past `config.timeout`; a check
/// still running at the deadline is abandoned.
pub async fn poll_until<F, Fut, T, E, D>(
    config: PollConfig,
    mut operation: F,
    done: D,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    D: Fn(&T) -> bool,
    E: std::error::Error + Send + Sync + 'static,
{
    config.validate()?;
    let started = Instant::now();
    let deadline = started + config.timeout;
    let mut interval = config.interval;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let value = match tokio::time::timeout_at(deadline, operation()).await {
            Ok(Ok(value)) => value,
            Ok(Err(source)) => {
                warn!(attempts, error = %source, "poll check failed");
                return Err(PollError::Operation { source, attempts });
            }
            Err(_) => return Err(PollError::TimedOut { attempts, elapsed: started.elapsed() }),
        };

        if done(&value) {
            debug!(attempts, "poll condition met");
            return Ok(value);
        }

        if Instant::now() + interval >= deadline {
            return Err(PollError::TimedOut { attempts, elapsed: started.elapsed() });
        }
        tokio::time::sleep(interval).await;
        interval = config.next_interval(interval);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, Error)]
    #[error("check broke")]
    struct ProbeError;

    #[tokio::test(start_paused = true)]
    async fn test_returns_first_accepted_value() {
        let counter = AtomicU32::new(0);
        let value = poll_until(
            PollConfig::new(Duration::from_millis(100), Duration::from_secs(5)),
            || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, ProbeError>(n) }
            },
            |n| *n >= 3,
        )
        .await
        .expect("condition met");
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_without_oversleeping() {
        let started = Instant::now();
        let result = poll_until(
            PollConfig::new(Duration::from_millis(100), Duration::from_millis(350)),
            || async { Ok::<_, ProbeError>(false) },
            |ready| *ready,
        )
        .await;

        assert!(matches!(result, Err(PollError::TimedOut { attempts: 4, .. })));
        assert!(started.elapsed() < Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_error_stops_polling() {
        let result = poll_until(
            PollConfig::default(),
            || async { Err::<bool, _>(ProbeError) },
            |ready| *ready,
        )
        .await;
        assert!(matches!(result, Err(PollError::Operation { attempts: 1, .. })));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = PollConfig::new(Duration::from_millis(100), Duration::from_secs(10))
            .with_backoff(3.0, Duration::from_millis(500));
        assert_eq!(config.next_interval(Duration::from_millis(100)), Duration::from_millis(300));
        assert_eq!(config.next_interval(Duration::from_millis(300)), Duration::from_millis(500));
    }
}
