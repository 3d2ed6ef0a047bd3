//! Circuit breaker state machine.
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls fail fast until the reset timeout elapses
//! - **HalfOpen**: a bounded number of trial calls decide whether to close
//!   again or reopen
//!
//! All counters live behind one mutex that is only held between awaits, and
//! every transition resets the per-state counters.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flightdeck_common::error::{CommonError, CommonResult, ErrorClassification, ErrorSeverity};
use flightdeck_common::time::{Clock, SystemClock};
use flightdeck_common::{EventBus, EventSubscription};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::panic_message;

/// Errors produced by a call through a [`CircuitBreaker`].
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Rejected without invoking the operation.
    ///
    /// `retry_after` is the time left until the breaker admits a trial call;
    /// `None` when the half-open trial slots are all taken.
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String, retry_after: Option<Duration> },

    /// The underlying operation failed
    #[error("Operation failed")]
    OperationFailed {
        #[source]
        source: E,
    },
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the breaker rejected the call without running it.
    ///
    /// Retry policies typically stop on this: another attempt would be
    /// rejected the same way until the reset timeout passes.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The operation's own error, when it ran and failed.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::OperationFailed { source } => Some(source),
            Self::CircuitOpen { .. } => None,
        }
    }

    /// Shared representation of a fast-fail.
    ///
    /// Returns `None` for operation failures; those belong to the caller's
    /// error type and have no `CommonError` equivalent.
    pub fn to_common(&self) -> Option<CommonError> {
        match self {
            Self::CircuitOpen { name, retry_after: Some(retry) } => {
                Some(CommonError::circuit_breaker_with_retry(name.clone(), *retry))
            }
            Self::CircuitOpen { name, retry_after: None } => {
                Some(CommonError::circuit_breaker(name.clone()))
            }
            Self::OperationFailed { .. } => None,
        }
    }
}

impl<E> ErrorClassification for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn is_retryable(&self) -> bool {
        self.is_circuit_open()
    }

    fn severity(&self) -> ErrorSeverity {
        match self {
            Self::CircuitOpen { .. } => ErrorSeverity::Warning,
            Self::OperationFailed { .. } => ErrorSeverity::Error,
        }
    }

    fn is_critical(&self) -> bool {
        false
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => *retry_after,
            Self::OperationFailed { .. } => None,
        }
    }
}

/// Result type for calls through a breaker
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing limited requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Notification published on every state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitEvent {
    /// The breaker named `name` moved from `from` to `to`.
    StateChanged { name: String, from: CircuitState, to: CircuitState },
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in Closed before opening
    pub failure_threshold: u64,
    /// Successful trials in HalfOpen before closing
    pub success_threshold: u64,
    /// Time spent Open before a trial call is admitted
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted in HalfOpen
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a configuration builder starting from the defaults
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::new()
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns a `CommonError::Config` naming the field when any threshold
    /// or the half-open call limit is zero.
    pub fn validate(&self) -> CommonResult<()> {
        if self.failure_threshold == 0 {
            return Err(CommonError::config_field(
                "failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(CommonError::config_field(
                "success_threshold",
                "must be greater than 0",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(CommonError::config_field(
                "half_open_max_calls",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Builder for CircuitBreakerConfig
#[derive(Debug, Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Create a builder holding the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the consecutive failures that open the circuit
    pub fn failure_threshold(mut self, threshold: u64) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set the successful trials needed to close from HalfOpen
    pub fn success_threshold(mut self, threshold: u64) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set how long the circuit stays Open before admitting a trial
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Set the number of concurrent trial calls admitted in HalfOpen
    pub fn half_open_max_calls(mut self, max_calls: u64) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Validate and return the configuration
    ///
    /// # Errors
    ///
    /// See [`CircuitBreakerConfig::validate`].
    pub fn build(self) -> CommonResult<CircuitBreakerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Circuit breaker metrics for monitoring
///
/// Per-state counters reset on every transition; the `total_*` counters
/// and `rejected_calls` cover the breaker's whole lifetime.
#[derive(Debug, Clone)]
pub struct CircuitBreakerMetrics {
    /// State at the time of the snapshot
    pub state: CircuitState,
    /// Failures in a row while Closed
    pub consecutive_failures: u64,
    /// Successful trials since entering HalfOpen
    pub half_open_successes: u64,
    /// Trial calls currently running
    pub half_open_in_flight: u64,
    /// Calls admitted to run
    pub total_calls: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls rejected without running
    pub rejected_calls: u64,
    pub last_failure_time: Option<Instant>,
    pub state_changed_at: Instant,
    /// When an Open breaker admits its next trial
    pub next_attempt_at: Option<Instant>,
}

struct BreakerState {
    state: CircuitState,
    /// Bumped on every transition; outcomes from an older generation are
    /// counted in totals but do not move the state machine.
    generation: u64,
    consecutive_failures: u64,
    half_open_successes: u64,
    half_open_in_flight: u64,
    next_attempt_at: Option<Instant>,
    total_calls: u64,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    last_failure_time: Option<Instant>,
    state_changed_at: Instant,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            consecutive_failures: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            next_attempt_at: None,
            total_calls: 0,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            last_failure_time: None,
            state_changed_at: now,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant, reset_timeout: Duration) -> (CircuitState, CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.half_open_in_flight = 0;
        self.state_changed_at = now;
        self.next_attempt_at = (to == CircuitState::Open).then(|| now + reset_timeout);
        (from, to)
    }
}

#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    trial: bool,
}

/// Releases a trial slot if the call never reports an outcome.
///
/// A panic while the operation runs counts as a failure; a dropped future
/// only frees the slot.
struct CallGuard<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    permit: Permit,
    armed: bool,
}

impl<C: Clock> Drop for CallGuard<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if std::thread::panicking() {
            self.breaker.on_failure(self.permit);
        } else {
            self.breaker.release(self.permit);
        }
    }
}

/// Circuit breaker gating an async operation.
///
/// Clones share the same state, so one breaker per downstream dependency
/// can be handed to every caller of that dependency.
///
/// The clock is a type parameter: production code uses [`SystemClock`],
/// tests drive the reset timeout with `MockClock`.
///
/// # Example
///
/// ```rust
/// # tokio_test::block_on(async {
/// use flightdeck_core::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
///
/// let breaker = CircuitBreaker::new(CircuitBreakerConfig::default()).unwrap().named("geocoder");
/// let found = breaker.execute(|| async { Ok::<_, std::io::Error>(3) }).await;
/// assert_eq!(found.ok(), Some(3));
/// assert_eq!(breaker.state(), CircuitState::Closed);
/// # });
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
    clock: Arc<C>,
    events: EventBus<CircuitEvent>,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            events: self.events.clone(),
        }
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker on the system clock.
    pub fn new(config: CircuitBreakerConfig) -> CommonResult<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker reading time from `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: C) -> CommonResult<Self> {
        config.validate()?;
        let now = clock.now();
        Ok(Self {
            name: Arc::from("default"),
            config,
            state: Arc::new(Mutex::new(BreakerState::new(now))),
            clock: Arc::new(clock),
            events: EventBus::new(64),
        })
    }

    /// Name used in errors, events and log records.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Arc::from(name.into());
        self
    }

    /// Name given with [`named`](Self::named), `"default"` otherwise.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration the breaker was built with.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` if the breaker admits it.
    ///
    /// In Open before the reset timeout this fails fast without invoking the
    /// operation. Once the timeout has elapsed the breaker moves to HalfOpen
    /// and the call becomes a trial.
    ///
    /// # Errors
    ///
    /// - [`ResilienceError::CircuitOpen`] when the call was rejected
    /// - [`ResilienceError::OperationFailed`] wrapping the operation's error
    ///
    /// A panic inside the operation is recorded as a failure and then
    /// propagates to the caller.
    #[instrument(skip(self, operation), fields(breaker = %self.name))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let permit = self.acquire().map_err(|retry_after| {
            debug!(?retry_after, "circuit breaker rejecting call");
            ResilienceError::CircuitOpen { name: self.name.to_string(), retry_after }
        })?;

        let mut guard = CallGuard { breaker: self, permit, armed: true };
        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(permit);
                Ok(value)
            }
            Err(error) => {
                warn!(error = %error, "operation failed under circuit breaker");
                self.on_failure(permit);
                Err(ResilienceError::OperationFailed { source: error })
            }
        }
    }

    /// Like [`execute`](Self::execute), but a fast-fail or operation failure
    /// returns `fallback(&error)` instead.
    ///
    /// A panicking fallback is caught and the original error is returned.
    pub async fn execute_with_fallback<F, Fut, T, E, G>(
        &self,
        operation: F,
        fallback: G,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
        G: FnOnce(&ResilienceError<E>) -> T,
    {
        let error = match self.execute(operation).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        match std::panic::catch_unwind(AssertUnwindSafe(|| fallback(&error))) {
            Ok(value) => {
                debug!(breaker = %self.name, "fallback value used");
                Ok(value)
            }
            Err(payload) => {
                warn!(
                    breaker = %self.name,
                    panic = %panic_message(payload.as_ref()),
                    "fallback panicked; returning original error"
                );
                Err(error)
            }
        }
    }

    fn acquire(&self) -> Result<Permit, Option<Duration>> {
        let now = self.clock.now();
        let mut transition = None;
        let admitted = {
            let mut state = self.state.lock();
            if state.state == CircuitState::Open {
                match state.next_attempt_at {
                    Some(at) if now < at => {
                        state.rejected_calls += 1;
                        return Err(Some(at - now));
                    }
                    _ => {
                        transition =
                            Some(state.transition(CircuitState::HalfOpen, now, self.config.reset_timeout));
                    }
                }
            }

            let admitted = match state.state {
                CircuitState::HalfOpen if state.half_open_in_flight >= self.config.half_open_max_calls => {
                    state.rejected_calls += 1;
                    Err(None)
                }
                CircuitState::HalfOpen => {
                    state.half_open_in_flight += 1;
                    Ok(Permit { generation: state.generation, trial: true })
                }
                _ => Ok(Permit { generation: state.generation, trial: false }),
            };
            if admitted.is_ok() {
                state.total_calls += 1;
            }
            admitted
        };

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
        admitted
    }

    fn on_success(&self, permit: Permit) {
        let transition = {
            let mut state = self.state.lock();
            state.total_successes += 1;
            if state.generation != permit.generation {
                None
            } else {
                match state.state {
                    CircuitState::Closed => {
                        state.consecutive_failures = 0;
                        None
                    }
                    CircuitState::HalfOpen => {
                        if permit.trial {
                            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
                        }
                        state.half_open_successes += 1;
                        (state.half_open_successes >= self.config.success_threshold).then(|| {
                            state.transition(CircuitState::Closed, self.clock.now(), self.config.reset_timeout)
                        })
                    }
                    CircuitState::Open => None,
                }
            }
        };

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn on_failure(&self, permit: Permit) {
        let now = self.clock.now();
        let transition = {
            let mut state = self.state.lock();
            state.total_failures += 1;
            state.last_failure_time = Some(now);
            if state.generation != permit.generation {
                None
            } else {
                match state.state {
                    CircuitState::Closed => {
                        state.consecutive_failures += 1;
                        (state.consecutive_failures >= self.config.failure_threshold)
                            .then(|| state.transition(CircuitState::Open, now, self.config.reset_timeout))
                    }
                    CircuitState::HalfOpen => {
                        Some(state.transition(CircuitState::Open, now, self.config.reset_timeout))
                    }
                    CircuitState::Open => None,
                }
            }
        };

        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn release(&self, permit: Permit) {
        let mut state = self.state.lock();
        if permit.trial && state.generation == permit.generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(breaker = %self.name, %from, %to, "circuit breaker opened"),
            _ => info!(breaker = %self.name, %from, %to, "circuit breaker state changed"),
        }
        self.events.publish(CircuitEvent::StateChanged { name: self.name.to_string(), from, to });
    }

    /// Current state. An expired Open state stays Open until the next call.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Snapshot of the breaker's counters, taken under one lock.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock();
        CircuitBreakerMetrics {
            state: state.state,
            consecutive_failures: state.consecutive_failures,
            half_open_successes: state.half_open_successes,
            half_open_in_flight: state.half_open_in_flight,
            total_calls: state.total_calls,
            total_successes: state.total_successes,
            total_failures: state.total_failures,
            rejected_calls: state.rejected_calls,
            last_failure_time: state.last_failure_time,
            state_changed_at: state.state_changed_at,
            next_attempt_at: state.next_attempt_at,
        }
    }

    /// Force the breaker back to Closed.
    ///
    /// Publishes a `StateChanged` event unless it was already Closed. Calls
    /// admitted before the reset no longer affect the state machine.
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let previous = state.state;
            state.transition(CircuitState::Closed, self.clock.now(), self.config.reset_timeout);
            (previous != CircuitState::Closed).then_some((previous, CircuitState::Closed))
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> EventSubscription<CircuitEvent> {
        self.events.subscribe()
    }
}
