//! Unit tests for health tracking
//!
//! Tests cover:
//! - Failed status tracks the consecutive-error threshold for any outcome sequence
//! - Cooldown gating with a paused clock
//! - Snapshots for operators

use std::time::Duration;

use proptest::prelude::*;

use scout::fault::ErrorCategory;
use scout::health::{HealthStatus, HealthTracker};

const ID: &str = "live_monitor";

proptest! {
    #[test]
    fn prop_failed_iff_threshold_reached(
        max_errors in 1u32..6,
        outcomes in proptest::collection::vec(any::<bool>(), 0..40),
    ) {
        let tracker = HealthTracker::with_policy(max_errors, Duration::from_secs(60));
        tracker.register(ID);

        let mut streak = 0u32;
        for success in &outcomes {
            if *success {
                tracker.record_success(ID);
                streak = 0;
            } else {
                tracker.record_error_as(ID, ErrorCategory::Network);
                streak += 1;
            }
        }

        let record = tracker.snapshot(ID).unwrap();
        prop_assert_eq!(record.consecutive_errors, streak);
        prop_assert_eq!(record.status == HealthStatus::Failed, streak >= max_errors);
        prop_assert_eq!(
            record.status == HealthStatus::Healthy,
            outcomes.last().is_none_or(|last| *last)
        );
        prop_assert_eq!(
            record.total_errors + record.total_successes,
            outcomes.len() as u64
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_cooldown_gates_availability() {
    let tracker = HealthTracker::with_policy(2, Duration::from_secs(30));

    tracker.record_error(ID);
    assert!(tracker.is_available(ID));
    tracker.record_error(ID);
    assert!(!tracker.is_available(ID));

    tokio::time::advance(Duration::from_secs(30)).await;
    assert!(!tracker.is_available(ID));

    tokio::time::advance(Duration::from_millis(1)).await;
    assert!(tracker.is_available(ID));

    // Still Failed until a success is observed.
    assert_eq!(tracker.snapshot(ID).unwrap().status, HealthStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_error_while_failed_rearms_cooldown() {
    let tracker = HealthTracker::with_policy(1, Duration::from_secs(10));

    tracker.record_error(ID);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(tracker.is_available(ID));

    tracker.record_error(ID);
    assert!(!tracker.is_available(ID));
}

#[test]
fn test_snapshot_all_sorted_and_reset() {
    let tracker = HealthTracker::default();
    tracker.register("system");
    tracker.register("briefing");
    tracker.record_error_as("data_source", ErrorCategory::Timeout);

    let ids: Vec<String> = tracker.snapshot_all().into_iter().map(|r| r.id).collect();
    assert_eq!(ids, vec!["briefing", "data_source", "system"]);

    let record = tracker.snapshot("data_source").unwrap();
    assert_eq!(record.last_error, Some(ErrorCategory::Timeout));

    tracker.reset("data_source");
    let record = tracker.snapshot("data_source").unwrap();
    assert_eq!(record.status, HealthStatus::Healthy);
    assert_eq!(record.total_errors, 0);
}

#[test]
fn test_unknown_id_is_available() {
    let tracker = HealthTracker::default();
    assert!(tracker.is_available("never_seen"));
    assert!(tracker.snapshot("never_seen").is_none());
}
