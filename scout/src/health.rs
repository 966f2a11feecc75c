//! Health tracking and circuit breaking
//!
//! One record per worker or data source id. Errors accumulate until the
//! configured threshold opens the circuit; while the cooldown runs the entity
//! is reported unavailable and callers skip it. After the cooldown the entity
//! is eligible again and the next success closes the circuit.
//!
//! # Features
//!
//! - Healthy / Degraded / Failed state machine per entity
//! - Cooldown measured on the tokio clock (pausable in tests)
//! - Lifetime success and error counters for reporting
//! - All updates for an id applied under a single lock

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fault::ErrorCategory;

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive errors that open the circuit
    pub max_errors: u32,

    /// How long an open circuit keeps the entity out of rotation
    pub cooldown_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            cooldown_secs: 60,
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Health state of a single entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

/// Snapshot of one entity's health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHealthRecord {
    pub id: String,
    pub status: HealthStatus,
    pub consecutive_errors: u32,

    #[serde(skip)]
    pub cooldown_until: Option<Instant>,

    pub total_successes: u64,
    pub total_errors: u64,
    pub last_error: Option<ErrorCategory>,
    pub last_transition: DateTime<Utc>,
}

impl WorkerHealthRecord {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: HealthStatus::Healthy,
            consecutive_errors: 0,
            cooldown_until: None,
            total_successes: 0,
            total_errors: 0,
            last_error: None,
            last_transition: Utc::now(),
        }
    }

    /// True while the circuit is open and the cooldown has not elapsed
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.status == HealthStatus::Failed
            && self.cooldown_until.is_some_and(|until| now <= until)
    }

    fn transition(&mut self, status: HealthStatus) {
        if self.status != status {
            self.status = status;
            self.last_transition = Utc::now();
        }
    }
}

// ============================================================================
// Tracker
// ============================================================================

/// Thread-safe registry of health records
pub struct HealthTracker {
    records: Mutex<HashMap<String, WorkerHealthRecord>>,
    max_errors: u32,
    cooldown: Duration,
}

impl HealthTracker {
    pub fn new(config: &HealthConfig) -> Self {
        Self::with_policy(config.max_errors, Duration::from_secs(config.cooldown_secs))
    }

    /// Build a tracker from an explicit threshold and cooldown.
    pub fn with_policy(max_errors: u32, cooldown: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            max_errors: max_errors.max(1),
            cooldown,
        }
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Create a Healthy record for `id` if none exists.
    pub fn register(&self, id: &str) {
        self.records
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| WorkerHealthRecord::new(id));
    }

    /// Reset the error count and close the circuit.
    pub fn record_success(&self, id: &str) -> HealthStatus {
        let mut records = self.records.lock();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| WorkerHealthRecord::new(id));

        if record.status != HealthStatus::Healthy {
            info!(
                "{} recovered after {} consecutive errors",
                id, record.consecutive_errors
            );
        }

        record.consecutive_errors = 0;
        record.cooldown_until = None;
        record.total_successes += 1;
        record.transition(HealthStatus::Healthy);
        record.status
    }

    /// Count one error of unknown category against `id`.
    pub fn record_error(&self, id: &str) -> HealthStatus {
        self.record_error_as(id, ErrorCategory::Unknown)
    }

    /// Count one error against `id`, opening the circuit at the threshold.
    pub fn record_error_as(&self, id: &str, category: ErrorCategory) -> HealthStatus {
        let now = Instant::now();
        let mut records = self.records.lock();
        let record = records
            .entry(id.to_string())
            .or_insert_with(|| WorkerHealthRecord::new(id));

        record.consecutive_errors = record.consecutive_errors.saturating_add(1);
        record.total_errors += 1;
        record.last_error = Some(category);

        if record.consecutive_errors >= self.max_errors {
            record.cooldown_until = Some(now + self.cooldown);
            if record.status != HealthStatus::Failed {
                warn!(
                    "{} marked failed after {} consecutive errors, cooling down for {:?}",
                    id, record.consecutive_errors, self.cooldown
                );
            }
            record.transition(HealthStatus::Failed);
        } else {
            debug!(
                "{} degraded ({}/{} errors, last: {})",
                id, record.consecutive_errors, self.max_errors, category
            );
            record.transition(HealthStatus::Degraded);
        }

        record.status
    }

    /// Whether `id` may be invoked now. Unknown ids are available.
    pub fn is_available(&self, id: &str) -> bool {
        let now = Instant::now();
        self.records
            .lock()
            .get(id)
            .is_none_or(|record| !record.in_cooldown(now))
    }

    pub fn snapshot(&self, id: &str) -> Option<WorkerHealthRecord> {
        self.records.lock().get(id).cloned()
    }

    /// All records, sorted by id
    pub fn snapshot_all(&self) -> Vec<WorkerHealthRecord> {
        let mut all: Vec<_> = self.records.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Forget the history of `id`, leaving a fresh Healthy record.
    pub fn reset(&self, id: &str) {
        self.records
            .lock()
            .insert(id.to_string(), WorkerHealthRecord::new(id));
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_id_is_available() {
        let tracker = HealthTracker::default();
        assert!(tracker.is_available("never-seen"));
        assert!(tracker.snapshot("never-seen").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_degrades_then_fails_at_threshold() {
        let tracker = HealthTracker::with_policy(3, Duration::from_secs(60));
        tracker.register("live_monitor");

        assert_eq!(tracker.record_error("live_monitor"), HealthStatus::Degraded);
        assert_eq!(tracker.record_error("live_monitor"), HealthStatus::Degraded);
        assert!(tracker.is_available("live_monitor"));

        assert_eq!(tracker.record_error("live_monitor"), HealthStatus::Failed);
        assert!(!tracker.is_available("live_monitor"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_counter() {
        let tracker = HealthTracker::with_policy(3, Duration::from_secs(60));

        tracker.record_error("briefing");
        tracker.record_error("briefing");
        assert_eq!(tracker.record_success("briefing"), HealthStatus::Healthy);

        let record = tracker.snapshot("briefing").unwrap();
        assert_eq!(record.consecutive_errors, 0);
        assert_eq!(record.total_errors, 2);
        assert_eq!(record.total_successes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_restores_eligibility() {
        let tracker = HealthTracker::with_policy(1, Duration::from_secs(60));
        tracker.record_error_as("huya", ErrorCategory::Network);
        assert!(!tracker.is_available("huya"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!tracker.is_available("huya"), "eligible only strictly after cooldown");

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.is_available("huya"));

        // Still Failed until a success is observed.
        assert_eq!(tracker.snapshot("huya").unwrap().status, HealthStatus::Failed);
        tracker.record_success("huya");
        assert_eq!(tracker.snapshot("huya").unwrap().status, HealthStatus::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_after_cooldown_rearms_it() {
        let tracker = HealthTracker::with_policy(2, Duration::from_secs(10));
        tracker.record_error("system");
        tracker.record_error("system");

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tracker.is_available("system"));

        assert_eq!(tracker.record_error("system"), HealthStatus::Failed);
        assert!(!tracker.is_available("system"));
    }

    #[test]
    fn test_reset_and_snapshot_all() {
        let tracker = HealthTracker::with_policy(1, Duration::from_secs(60));
        tracker.register("b");
        tracker.record_error("a");
        tracker.reset("a");

        let all = tracker.snapshot_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert_eq!(all[0].status, HealthStatus::Healthy);
        assert_eq!(all[0].total_errors, 0);
    }
}
