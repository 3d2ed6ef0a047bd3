//! Integration tests for observability module
//!
//! Covers event fan-out across tasks and logging initialisation.

#![cfg(feature = "runtime")]

use std::time::Duration;

use flightdeck_common::observability::{init_for_tests, EventBus, LogFormat};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Opened,
    Closed,
}

/// Validates that subscribers on other tasks receive events in publish order.
///
/// # Test Steps
/// 1. Spawn two subscriber tasks that collect two events each
/// 2. Publish two events from the test task
/// 3. Verify both collectors saw the same ordered sequence
#[tokio::test(flavor = "multi_thread")]
async fn test_event_bus_cross_task_delivery() {
    init_for_tests();
    let bus = EventBus::new(16);

    let mut handles = Vec::new();
    for _ in 0..2 {
        let mut sub = bus.subscribe();
        handles.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 2 {
                match sub.recv().await {
                    Some(event) => seen.push(event),
                    None => break,
                }
            }
            seen
        }));
    }

    assert_eq!(bus.subscriber_count(), 2);
    bus.publish(Transition::Opened);
    bus.publish(Transition::Closed);

    for handle in handles {
        let seen = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("subscriber timed out")
            .expect("subscriber panicked");
        assert_eq!(seen, vec![Transition::Opened, Transition::Closed]);
    }
}

/// Validates that a subscription created after a publish does not see it.
#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let bus = EventBus::new(4);
    let _early = bus.subscribe();
    bus.publish(Transition::Opened);

    let mut late = bus.subscribe();
    assert_eq!(late.try_recv(), None);
    bus.publish(Transition::Closed);
    assert_eq!(late.recv().await, Some(Transition::Closed));
}

#[test]
fn test_log_format_from_config_string() {
    let format: LogFormat = "json".parse().expect("valid format");
    assert_eq!(format, LogFormat::Json);
}
