//! Retry with backoff
//!
//! [`RetryExecutor`] re-runs a fallible async operation until it succeeds,
//! the [`RetryPolicy`] refuses the error, attempts run out, or the overall
//! deadline would be crossed. Attempts are numbered from 1.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use flightdeck_common::error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
use rand::Rng;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::panic_message;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffStrategy {
    /// Always `initial_delay`
    Fixed,
    /// `initial_delay * attempt`
    Linear,
    /// `initial_delay * multiplier^(attempt - 1)`
    Exponential { multiplier: f64 },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential { multiplier: 2.0 }
    }
}

/// Randomisation applied to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`
    Equal,
    /// Uniform in `[delay * (1 - ratio), delay * (1 + ratio)]`
    Proportional(f64),
}

impl Default for Jitter {
    fn default() -> Self {
        Self::Proportional(0.1)
    }
}

impl Jitter {
    fn apply(self, delay: Duration) -> Duration {
        let secs = delay.as_secs_f64();
        if secs <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let jittered = match self {
            Jitter::None => secs,
            Jitter::Full => rng.gen_range(0.0..=secs),
            Jitter::Equal => secs / 2.0 + rng.gen_range(0.0..=secs / 2.0),
            Jitter::Proportional(ratio) => {
                let spread = secs * ratio.clamp(0.0, 1.0);
                if spread <= 0.0 {
                    secs
                } else {
                    rng.gen_range(secs - spread..=secs + spread)
                }
            }
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Wait after the first failed attempt
    pub initial_delay: Duration,
    /// Upper bound on any single wait, jitter included
    pub max_delay: Duration,
    /// How the wait grows between attempts
    pub backoff: BackoffStrategy,
    /// Randomisation applied to each wait
    pub jitter: Jitter,
    /// Overall budget measured from the first attempt
    pub deadline: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff: BackoffStrategy::default(),
            jitter: Jitter::default(),
            deadline: None,
        }
    }
}

impl RetryConfig {
    /// Create a configuration builder starting from the defaults
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `CommonError::Config` naming the offending field when:
    /// - `max_attempts` is zero
    /// - `initial_delay` exceeds `max_delay`
    /// - an exponential multiplier is below 1.0 or not finite
    /// - a proportional jitter ratio falls outside `0.0..=1.0`
    pub fn validate(&self) -> CommonResult<()> {
        if self.max_attempts == 0 {
            return Err(CommonError::config_field("max_attempts", "must be greater than 0"));
        }
        if self.initial_delay > self.max_delay {
            return Err(CommonError::config_field(
                "initial_delay",
                "must not exceed max_delay",
            ));
        }
        if let BackoffStrategy::Exponential { multiplier } = self.backoff {
            if !multiplier.is_finite() || multiplier < 1.0 {
                return Err(CommonError::config_field(
                    "multiplier",
                    "must be a finite value of at least 1.0",
                ));
            }
        }
        if let Jitter::Proportional(ratio) = self.jitter {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(CommonError::config_field("jitter", "ratio must be within 0.0..=1.0"));
            }
        }
        Ok(())
    }

    /// Un-jittered delay after failed attempt `attempt` (1-based).
    ///
    /// With the default exponential backoff and a 100ms initial delay this
    /// yields 100ms, 200ms, 400ms and so on, capped at `max_delay`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let step = attempt.max(1);
        let raw = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay.as_secs_f64(),
            BackoffStrategy::Linear => self.initial_delay.as_secs_f64() * f64::from(step),
            BackoffStrategy::Exponential { multiplier } => {
                let exponent = i32::try_from(step - 1).unwrap_or(i32::MAX);
                self.initial_delay.as_secs_f64() * multiplier.powi(exponent)
            }
        };
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay after failed attempt `attempt`, jitter included, never above
    /// `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base_delay(attempt)).min(self.max_delay)
    }
}

/// Builder for RetryConfig
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    /// Create a builder holding the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total number of attempts, including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Set the wait after the first failure
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.config.initial_delay = delay;
        self
    }

    /// Set the cap on any single wait
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the backoff strategy
    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.config.backoff = backoff;
        self
    }

    /// Set the jitter applied to each wait
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Bound the whole run, waits included, measured from the first attempt
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    /// Validate and return the configuration
    ///
    /// # Errors
    ///
    /// See [`RetryConfig::validate`].
    pub fn build(self) -> CommonResult<RetryConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Successful outcome with attempt bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    #[error("Gave up after {attempts} attempts")]
    MaxAttemptsExceeded {
        #[source]
        source: E,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("Non-retryable failure on attempt {attempts}")]
    NonRetryable {
        #[source]
        source: E,
        attempts: u32,
        elapsed: Duration,
    },

    /// `last_error` is `None` when the final attempt was cut off by the
    /// deadline instead of failing on its own.
    #[error("Retry deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { last_error: Option<E>, attempts: u32, elapsed: Duration },

    #[error(transparent)]
    Common(#[from] CommonError),
}

impl<E> RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Attempts made before giving up; zero for configuration errors.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::MaxAttemptsExceeded { attempts, .. }
            | Self::NonRetryable { attempts, .. }
            | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::Common(_) => 0,
        }
    }

    /// The last error produced by the operation, if any.
    pub fn into_last_error(self) -> Option<E> {
        match self {
            Self::MaxAttemptsExceeded { source, .. } | Self::NonRetryable { source, .. } => {
                Some(source)
            }
            Self::DeadlineExceeded { last_error, .. } => last_error,
            Self::Common(_) => None,
        }
    }
}

impl<E> ErrorClassification for RetryError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        match self {
            Self::Common(e) => e.is_retryable(),
            _ => false,
        }
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Common(e) => e.severity(),
            _ => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        matches!(self, Self::Common(e) if e.is_critical())
    }

    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Decides whether a failed attempt should be retried.
pub trait RetryPolicy<E>: Send + Sync {
    fn should_retry(&self, error: &E, attempt: u32) -> bool;
}

impl<E, F> RetryPolicy<E> for F
where
    F: Fn(&E, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &E, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Common retry policies
pub mod policies {
    use flightdeck_common::error::ErrorClassification;

    use super::RetryPolicy;

    /// Retry every error
    #[derive(Debug, Clone, Copy, Default)]
    pub struct AlwaysRetry;

    impl<E> RetryPolicy<E> for AlwaysRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            true
        }
    }

    /// Never retry
    #[derive(Debug, Clone, Copy, Default)]
    pub struct NeverRetry;

    impl<E> RetryPolicy<E> for NeverRetry {
        fn should_retry(&self, _error: &E, _attempt: u32) -> bool {
            false
        }
    }

    /// Retry errors that classify themselves as retryable
    #[derive(Debug, Clone, Copy, Default)]
    pub struct RetryClassified;

    impl<E: ErrorClassification> RetryPolicy<E> for RetryClassified {
        fn should_retry(&self, error: &E, _attempt: u32) -> bool {
            error.is_retryable()
        }
    }
}

type RetryHook<E> = Arc<dyn Fn(&E, u32, Duration) + Send + Sync>;

/// Runs operations under a [`RetryConfig`] and [`RetryPolicy`].
pub struct RetryExecutor<E> {
    config: RetryConfig,
    policy: Arc<dyn RetryPolicy<E>>,
    on_retry: Option<RetryHook<E>>,
}

impl<E> Clone for RetryExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            policy: Arc::clone(&self.policy),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryExecutor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

impl<E> RetryExecutor<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Executor that retries every error.
    pub fn new(config: RetryConfig) -> CommonResult<Self> {
        Self::with_policy(config, policies::AlwaysRetry)
    }

    /// Executor that retries only errors `policy` accepts.
    ///
    /// # Errors
    ///
    /// Returns the validation error when `config` is invalid.
    pub fn with_policy<P>(config: RetryConfig, policy: P) -> CommonResult<Self>
    where
        P: RetryPolicy<E> + 'static,
    {
        config.validate()?;
        Ok(Self { config, policy: Arc::new(policy), on_retry: None })
    }

    /// Hook run before each backoff wait with the error, the attempt that
    /// failed and the chosen delay. A panicking hook is logged and ignored.
    #[must_use]
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(&E, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Configuration the executor was built with.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or the executor gives up.
    ///
    /// `operation` is called once per attempt. Between attempts the executor
    /// sleeps for [`RetryConfig::delay_for`]; with a deadline configured it
    /// never sleeps past it, and each attempt is cut off when it expires.
    ///
    /// # Errors
    ///
    /// - [`RetryError::NonRetryable`] when the policy refuses an error
    /// - [`RetryError::MaxAttemptsExceeded`] after the last attempt fails
    /// - [`RetryError::DeadlineExceeded`] when the overall budget runs out
    #[instrument(skip(self, operation), fields(max_attempts = self.config.max_attempts))]
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<Retried<T>, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let started = Instant::now();
        let deadline = self.config.deadline.map(|budget| started + budget);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let outcome = match deadline {
                Some(at) => match tokio::time::timeout_at(at, operation()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(attempt, "attempt cut off by retry deadline");
                        return Err(RetryError::DeadlineExceeded {
                            last_error: None,
                            attempts: attempt,
                            elapsed: started.elapsed(),
                        });
                    }
                },
                None => operation().await,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(Retried { value, attempts: attempt, elapsed: started.elapsed() });
                }
                Err(error) => error,
            };

            if attempt >= self.config.max_attempts {
                warn!(attempt, error = %error, "retry attempts exhausted");
                return Err(RetryError::MaxAttemptsExceeded {
                    source: error,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }

            if !self.permits_retry(&error, attempt) {
                debug!(attempt, error = %error, "error not retryable");
                return Err(RetryError::NonRetryable {
                    source: error,
                    attempts: attempt,
                    elapsed: started.elapsed(),
                });
            }

            let delay = self.config.delay_for(attempt);
            if let Some(at) = deadline {
                if Instant::now() + delay >= at {
                    warn!(attempt, ?delay, "next retry would cross the deadline");
                    return Err(RetryError::DeadlineExceeded {
                        last_error: Some(error),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    });
                }
            }

            self.notify(&error, attempt, delay);
            debug!(attempt, ?delay, error = %error, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }
    }

    fn permits_retry(&self, error: &E, attempt: u32) -> bool {
        let policy = &self.policy;
        match std::panic::catch_unwind(AssertUnwindSafe(|| policy.should_retry(error, attempt))) {
            Ok(decision) => decision,
            Err(payload) => {
                warn!(panic = %panic_message(payload.as_ref()), "retry policy panicked; giving up");
                false
            }
        }
    }

    fn notify(&self, error: &E, attempt: u32, delay: Duration) {
        let Some(hook) = &self.on_retry else {
            return;
        };
        if let Err(payload) = std::panic::catch_unwind(AssertUnwindSafe(|| hook(error, attempt, delay))) {
            warn!(panic = %panic_message(payload.as_ref()), "on_retry hook panicked");
        }
    }
}

/// Retry every error under `config`.
pub async fn with_retry<F, Fut, T, E>(
    config: RetryConfig,
    operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    RetryExecutor::new(config)?.execute(operation).await
}

/// Retry errors accepted by `policy` under `config`.
pub async fn retry_with_policy<F, Fut, T, E, P>(
    config: RetryConfig,
    policy: P,
    operation: F,
) -> Result<Retried<T>, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
    P: RetryPolicy<E> + 'static,
{
    RetryExecutor::with_policy(config, policy)?.execute(operation).await
}
