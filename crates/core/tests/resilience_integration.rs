//! Integration tests for resilience patterns
//!
//! Exercises the breaker, retry executor and polling helper together, the way
//! a caller wraps an unreliable dependency.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flightdeck_common::error::ErrorClassification;
use flightdeck_common::time::MockClock;
use flightdeck_core::resilience::{
    poll_until, policies, retry_with_policy, CircuitBreaker, CircuitBreakerConfig, CircuitEvent,
    CircuitState, Jitter, PollConfig, ResilienceError, RetryConfig, RetryError, RetryExecutor,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
struct ServiceError {
    message: String,
}

fn service_error(message: &str) -> ServiceError {
    ServiceError { message: message.to_string() }
}

fn quick_retry(attempts: u32) -> RetryConfig {
    RetryConfig::builder()
        .max_attempts(attempts)
        .initial_delay(Duration::from_millis(10))
        .max_delay(Duration::from_millis(40))
        .jitter(Jitter::None)
        .build()
        .expect("valid retry config")
}

/// Validates the full breaker cycle on a mock clock.
///
/// # Test Steps
/// 1. Fail three times against a threshold of 3 and observe Open
/// 2. Call before the reset timeout; the operation must not run
/// 3. Advance past the timeout; the next call runs as a HalfOpen trial
/// 4. Succeed and observe Closed, with every transition published
#[tokio::test]
async fn test_breaker_open_half_open_closed_cycle() {
    let clock = MockClock::new();
    let config = CircuitBreakerConfig::builder()
        .failure_threshold(3)
        .reset_timeout(Duration::from_secs(30))
        .build()
        .expect("valid config");
    let breaker = CircuitBreaker::with_clock(config, clock.clone()).expect("breaker").named("ledger");
    let mut events = breaker.subscribe();
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let result = breaker
            .execute(|| async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(service_error("503"))
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::OperationFailed { .. })));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_secs(29));
    let rejected = breaker
        .execute(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ServiceError>(())
        })
        .await;
    assert!(rejected.as_ref().is_err_and(|e| e.is_circuit_open() && e.is_retryable()));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_secs(1));
    let trial = breaker
        .execute(|| async {
            invocations.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ServiceError>("recovered")
        })
        .await;
    assert_eq!(trial.ok(), Some("recovered"));
    assert_eq!(invocations.load(Ordering::SeqCst), 4);
    assert_eq!(breaker.state(), CircuitState::Closed);

    let transitions: Vec<(CircuitState, CircuitState)> = events
        .drain()
        .into_iter()
        .map(|CircuitEvent::StateChanged { from, to, .. }| (from, to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );

    let metrics = breaker.metrics();
    assert_eq!(metrics.rejected_calls, 1);
    assert_eq!(metrics.total_failures, 3);
}

/// Validates that retry stops as soon as the breaker starts fast-failing.
#[tokio::test(start_paused = true)]
async fn test_retry_stops_when_breaker_opens() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder().failure_threshold(2).build().expect("valid config"),
    )
    .expect("breaker");
    let invocations = Arc::new(AtomicU32::new(0));

    let result = retry_with_policy(
        quick_retry(5),
        |error: &ResilienceError<ServiceError>, _attempt: u32| !error.is_circuit_open(),
        || {
            let invocations = Arc::clone(&invocations);
            let breaker = breaker.clone();
            async move {
                breaker
                    .execute(|| async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        Err::<(), _>(service_error("timeout"))
                    })
                    .await
            }
        },
    )
    .await;

    match result {
        Err(RetryError::NonRetryable { source, attempts, .. }) => {
            assert!(source.is_circuit_open());
            assert_eq!(attempts, 3);
        }
        other => panic!("expected breaker to end retries, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_classified_policy_retries_only_transient_errors() {
    let calls = AtomicU32::new(0);
    let executor: RetryExecutor<flightdeck_common::CommonError> =
        RetryExecutor::with_policy(quick_retry(4), policies::RetryClassified).expect("executor");

    let result = executor
        .execute(|| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(flightdeck_common::CommonError::timeout("fetch", Duration::from_secs(1)))
                } else {
                    Err(flightdeck_common::CommonError::validation("id", "malformed"))
                }
            }
        })
        .await
        .map(|retried: flightdeck_core::resilience::Retried<()>| retried.value);

    assert!(matches!(result, Err(RetryError::NonRetryable { attempts: 2, .. })));
}

#[tokio::test]
async fn test_fallback_serves_cached_value_while_open() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .reset_timeout(Duration::from_secs(60))
            .build()
            .expect("valid config"),
    )
    .expect("breaker");

    let _ = breaker.execute(|| async { Err::<u32, _>(service_error("down")) }).await;
    assert_eq!(breaker.state(), CircuitState::Open);

    let served = breaker
        .execute_with_fallback(|| async { Ok::<u32, ServiceError>(1) }, |_| 42)
        .await;
    assert_eq!(served.ok(), Some(42));
}

#[tokio::test(start_paused = true)]
async fn test_poll_until_job_finishes() {
    let progress = Arc::new(AtomicU32::new(0));
    let worker = Arc::clone(&progress);
    tokio::spawn(async move {
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(30)).await;
            worker.fetch_add(20, Ordering::SeqCst);
        }
    });

    let done = poll_until(
        PollConfig::new(Duration::from_millis(25), Duration::from_secs(2)),
        || {
            let progress = Arc::clone(&progress);
            async move { Ok::<_, ServiceError>(progress.load(Ordering::SeqCst)) }
        },
        |percent| *percent >= 100,
    )
    .await
    .expect("job finishes before the deadline");
    assert_eq!(done, 100);
}
