//! Performance metrics
//!
//! Prometheus counters and histograms for requests, worker calls, data
//! source queries and cache lookups, plus an in-process tracker with
//! per-operation latency statistics and a bounded slow-call log that is
//! surfaced in the health report.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

const LATENCY_BUCKETS: &[f64] = &[0.05, 0.1, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Calls slower than this land in the slow-call log
    pub slow_call_threshold_ms: u64,

    /// Entries kept in the slow-call log
    pub slow_log_capacity: usize,

    /// Recent durations kept per operation for percentiles
    pub latency_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            slow_call_threshold_ms: 3_000,
            slow_log_capacity: 100,
            latency_window: 100,
        }
    }
}

impl MetricsConfig {
    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

/// How a call ended, as a metric label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Error,
    Timeout,
    Skipped,
    Abandoned,
}

impl CallOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Skipped => "skipped",
            Self::Abandoned => "abandoned",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(self, Self::Error | Self::Timeout)
    }
}

// ============================================================================
// Tracker
// ============================================================================

#[derive(Debug, Default)]
struct OperationStats {
    count: u64,
    errors: u64,
    total: Duration,
    min: Option<Duration>,
    max: Duration,
    recent: VecDeque<Duration>,
    last_called: Option<DateTime<Utc>>,
}

/// Latency summary of one operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSummary {
    pub name: String,
    pub count: u64,
    pub errors: u64,
    pub error_rate: f64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub last_called: Option<DateTime<Utc>>,
}

/// An operation that exceeded the slow-call threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlowCall {
    pub name: String,
    pub duration_ms: f64,
    pub at: DateTime<Utc>,
}

/// Tracker contents for the health report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub operations: Vec<OperationSummary>,

    /// Newest first
    pub slow_calls: Vec<SlowCall>,
}

#[derive(Default)]
struct TrackerState {
    operations: BTreeMap<String, OperationStats>,
    slow_calls: VecDeque<SlowCall>,
}

fn millis(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn percentile(sorted: &[Duration], fraction: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let index = ((sorted.len() as f64) * fraction) as usize;
    sorted[index.min(sorted.len() - 1)]
}

impl OperationStats {
    fn summary(&self, name: &str) -> OperationSummary {
        let mut sorted: Vec<Duration> = self.recent.iter().copied().collect();
        sorted.sort();

        let avg = if self.count == 0 {
            Duration::ZERO
        } else {
            self.total.div_f64(self.count as f64)
        };

        OperationSummary {
            name: name.to_string(),
            count: self.count,
            errors: self.errors,
            error_rate: if self.count == 0 {
                0.0
            } else {
                self.errors as f64 / self.count as f64
            },
            avg_ms: millis(avg),
            min_ms: millis(self.min.unwrap_or_default()),
            max_ms: millis(self.max),
            p50_ms: millis(percentile(&sorted, 0.5)),
            p95_ms: millis(percentile(&sorted, 0.95)),
            last_called: self.last_called,
        }
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Metric families and the performance tracker
pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    worker_calls: IntCounterVec,
    worker_duration: HistogramVec,
    source_queries: IntCounterVec,
    source_duration: HistogramVec,
    cache_lookups: IntCounterVec,
    tracker: Mutex<TrackerState>,
    config: MetricsConfig,
}

impl Metrics {
    /// Metrics registered in a fresh registry.
    pub fn new(config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        Self::with_registry(Registry::new(), config)
    }

    pub fn with_registry(registry: Registry, config: &MetricsConfig) -> Result<Self, prometheus::Error> {
        let requests = IntCounterVec::new(
            Opts::new("scout_requests_total", "Queries handled"),
            &["intent", "status"],
        )?;
        registry.register(Box::new(requests.clone()))?;

        let worker_calls = IntCounterVec::new(
            Opts::new("scout_worker_calls_total", "Worker task outcomes"),
            &["worker", "operation", "outcome"],
        )?;
        registry.register(Box::new(worker_calls.clone()))?;

        let worker_duration = HistogramVec::new(
            HistogramOpts::new("scout_worker_duration_seconds", "Worker invocation latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["worker", "operation"],
        )?;
        registry.register(Box::new(worker_duration.clone()))?;

        let source_queries = IntCounterVec::new(
            Opts::new("scout_datasource_queries_total", "Data source attempts"),
            &["source", "outcome"],
        )?;
        registry.register(Box::new(source_queries.clone()))?;

        let source_duration = HistogramVec::new(
            HistogramOpts::new("scout_datasource_duration_seconds", "Data source latency")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["source"],
        )?;
        registry.register(Box::new(source_duration.clone()))?;

        let cache_lookups = IntCounterVec::new(
            Opts::new("scout_cache_lookups_total", "Cache lookups by result"),
            &["cache", "result"],
        )?;
        registry.register(Box::new(cache_lookups.clone()))?;

        Ok(Self {
            registry,
            requests,
            worker_calls,
            worker_duration,
            source_queries,
            source_duration,
            cache_lookups,
            tracker: Mutex::new(TrackerState::default()),
            config: config.clone(),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_request(&self, intent: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        self.requests.with_label_values(&[intent, status]).inc();
    }

    /// Count a worker task; `elapsed` is `None` when the worker was never invoked.
    pub fn record_worker_call(
        &self,
        worker: &str,
        operation: &str,
        outcome: CallOutcome,
        elapsed: Option<Duration>,
    ) {
        self.worker_calls
            .with_label_values(&[worker, operation, outcome.as_str()])
            .inc();

        if let Some(elapsed) = elapsed {
            self.worker_duration
                .with_label_values(&[worker, operation])
                .observe(elapsed.as_secs_f64());
            self.track(&format!("worker:{worker}.{operation}"), elapsed, outcome.is_failure());
        }
    }

    pub fn record_source_query(&self, source: &str, outcome: CallOutcome, elapsed: Duration) {
        self.source_queries
            .with_label_values(&[source, outcome.as_str()])
            .inc();
        self.source_duration
            .with_label_values(&[source])
            .observe(elapsed.as_secs_f64());
        self.track(&format!("source:{source}"), elapsed, outcome.is_failure());
    }

    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.cache_lookups.with_label_values(&[cache, result]).inc();
    }

    fn track(&self, name: &str, elapsed: Duration, failed: bool) {
        let mut state = self.tracker.lock();

        let stats = state.operations.entry(name.to_string()).or_default();
        stats.count += 1;
        if failed {
            stats.errors += 1;
        }
        stats.total += elapsed;
        stats.min = Some(stats.min.map_or(elapsed, |min| min.min(elapsed)));
        stats.max = stats.max.max(elapsed);
        stats.last_called = Some(Utc::now());
        stats.recent.push_back(elapsed);
        while stats.recent.len() > self.config.latency_window.max(1) {
            stats.recent.pop_front();
        }

        if elapsed > self.config.slow_call_threshold() {
            warn!("slow call: {} took {:?}", name, elapsed);
            state.slow_calls.push_front(SlowCall {
                name: name.to_string(),
                duration_ms: millis(elapsed),
                at: Utc::now(),
            });
            state.slow_calls.truncate(self.config.slow_log_capacity);
        }
    }

    pub fn report(&self) -> PerformanceReport {
        let state = self.tracker.lock();
        PerformanceReport {
            operations: state
                .operations
                .iter()
                .map(|(name, stats)| stats.summary(name))
                .collect(),
            slow_calls: state.slow_calls.iter().cloned().collect(),
        }
    }

    /// Drop tracked statistics; Prometheus counters are monotonic and stay.
    pub fn reset(&self) {
        let mut state = self.tracker.lock();
        state.operations.clear();
        state.slow_calls.clear();
    }

    /// Prometheus text exposition of every registered family
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
