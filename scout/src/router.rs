//! Data source routing with failover
//!
//! Sources are tried in ascending priority order. The response cache is
//! consulted first and sources whose circuit is open are skipped. Each
//! attempt is bounded by the per-source timeout and by whatever remains of
//! the caller's budget. The first success is cached and returned.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, ResponseCache};
use crate::fault::{ErrorCategory, ErrorDetail, Fault, classify};
use crate::health::{HealthTracker, WorkerHealthRecord};
use crate::metrics::{CallOutcome, Metrics};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound for one source attempt; must stay below the task timeout
    /// so a hanging source leaves room to fail over
    pub fetch_timeout_ms: u64,

    /// Lifetime of a cached source result
    pub default_ttl_secs: u64,

    /// Per-source overrides of `default_ttl_secs`
    pub source_ttl_secs: HashMap<String, u64>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            fetch_timeout_ms: 3_000,
            default_ttl_secs: 60,
            source_ttl_secs: HashMap::new(),
        }
    }
}

impl RouterConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn ttl_for(&self, source: &str) -> Duration {
        let secs = self
            .source_ttl_secs
            .get(source)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

// ============================================================================
// Queries and results
// ============================================================================

/// Request for data, independent of which source answers it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataQuery {
    pub query_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

impl DataQuery {
    pub fn new(query_type: impl Into<String>) -> Self {
        Self {
            query_type: query_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn param_str(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).and_then(Value::as_str)
    }

    /// Identical type and parameters yield identical keys.
    pub fn cache_key(&self) -> CacheKey {
        let params: serde_json::Map<String, Value> = self
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        CacheKey::digest(&format!("{}:{}", self.query_type, Value::Object(params)))
    }
}

/// Data plus the identity of the source that produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataResult {
    pub data: Value,
    pub source: String,
    pub cached: bool,
    pub fetched_at: DateTime<Utc>,
}

/// A backend able to answer [`DataQuery`]s
#[async_trait]
pub trait DataSource: Send + Sync {
    fn id(&self) -> &str;

    /// Lower values are tried first.
    fn priority(&self) -> u32;

    async fn fetch(&self, query: &DataQuery, timeout: Duration) -> Result<Value, Fault>;

    /// Cheap liveness check
    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(
        "all data sources exhausted for '{query_type}' (attempted: [{}], skipped: [{}])",
        .attempted.join(", "),
        .skipped.join(", ")
    )]
    Exhausted {
        query_type: String,
        attempted: Vec<String>,
        skipped: Vec<String>,
        last_error: Option<ErrorDetail>,

        /// Time spent across all attempts
        elapsed: Duration,
    },
}

impl RouterError {
    /// Caller-facing detail, carrying the last source failure's category.
    pub fn detail(&self) -> ErrorDetail {
        match self {
            Self::Exhausted {
                query_type,
                last_error,
                ..
            } => {
                let category = last_error
                    .as_ref()
                    .map_or(ErrorCategory::UpstreamApi, |e| e.category);
                ErrorDetail::new(
                    category,
                    format!("no data source could answer '{query_type}'"),
                )
            }
        }
    }
}

impl From<RouterError> for Fault {
    fn from(err: RouterError) -> Self {
        let detail = err.detail();
        let RouterError::Exhausted { elapsed, .. } = &err;
        match detail.category {
            ErrorCategory::Timeout => Fault::Timeout(*elapsed),
            ErrorCategory::Network => Fault::Connection(err.to_string()),
            ErrorCategory::Validation => Fault::InvalidInput(err.to_string()),
            _ => Fault::upstream(err.to_string()),
        }
    }
}

// ============================================================================
// Router
// ============================================================================

pub struct DataSourceRouter {
    sources: Vec<Arc<dyn DataSource>>,
    health: Arc<HealthTracker>,
    cache: Arc<ResponseCache<DataResult>>,
    metrics: Option<Arc<Metrics>>,
    sweeper: Option<JoinHandle<()>>,
    config: RouterConfig,
}

impl DataSourceRouter {
    pub fn new(
        health: Arc<HealthTracker>,
        cache: Arc<ResponseCache<DataResult>>,
        config: RouterConfig,
    ) -> Self {
        Self {
            sources: Vec::new(),
            health,
            cache,
            metrics: None,
            sweeper: None,
            config,
        }
    }

    /// Add a source, keeping the list ordered by priority.
    pub fn with_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.health.register(source.id());
        self.sources.push(source);
        self.sources.sort_by_key(|s| s.priority());
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Purge expired source results every `interval`; zero disables it.
    pub fn with_sweeper(mut self, interval: Duration) -> Self {
        if let Some(previous) = self.sweeper.take() {
            previous.abort();
        }
        self.sweeper = self.cache.start_sweeper(interval);
        self
    }

    /// Source ids in the order they are tried
    pub fn source_ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    /// Fetch without an overall budget; each attempt is still bounded.
    pub async fn fetch(&self, query: &DataQuery) -> Result<DataResult, RouterError> {
        self.fetch_within(query, None).await
    }

    /// Fetch, giving up once `budget` has elapsed across all attempts.
    ///
    /// Each attempt gets the smaller of the per-source timeout and what is
    /// left of the budget. Sources not reached in time are reported as skipped.
    pub async fn fetch_within(
        &self,
        query: &DataQuery,
        budget: Option<Duration>,
    ) -> Result<DataResult, RouterError> {
        let started = Instant::now();
        let key = query.cache_key();

        let hit = self.cache.get(&key);
        if let Some(metrics) = &self.metrics {
            metrics.record_cache_lookup("source", hit.is_some());
        }
        if let Some(mut hit) = hit {
            debug!("serving '{}' from cache ({})", query.query_type, hit.source);
            hit.cached = true;
            return Ok(hit);
        }

        let deadline = budget.and_then(|b| started.checked_add(b));
        let fetch_timeout = self.config.fetch_timeout();
        let mut attempted = Vec::new();
        let mut skipped = Vec::new();
        let mut last_error = None;

        for source in &self.sources {
            let id = source.id();
            let now = Instant::now();

            let timeout = match deadline {
                Some(deadline) if now >= deadline => {
                    debug!("budget spent before trying data source {}", id);
                    skipped.push(id.to_string());
                    continue;
                }
                Some(deadline) => fetch_timeout.min(deadline - now),
                None => fetch_timeout,
            };

            if !self.health.is_available(id) {
                debug!("skipping data source {} (cooling down)", id);
                skipped.push(id.to_string());
                continue;
            }
            attempted.push(id.to_string());

            let outcome = tokio::time::timeout(timeout, source.fetch(query, timeout)).await;
            let elapsed = now.elapsed();

            match outcome {
                Ok(Ok(data)) => {
                    self.health.record_success(id);
                    self.record(id, CallOutcome::Success, elapsed);
                    let result = DataResult {
                        data,
                        source: id.to_string(),
                        cached: false,
                        fetched_at: Utc::now(),
                    };
                    self.cache.set(key, result.clone(), self.config.ttl_for(id));
                    info!("'{}' answered by {}", query.query_type, id);
                    return Ok(result);
                }
                Ok(Err(fault)) => {
                    let class = classify(&fault);
                    if class.recoverable {
                        self.health.record_error_as(id, class.category);
                    }
                    self.record(id, CallOutcome::Error, elapsed);
                    warn!("data source {} failed ({}): {}", id, class.category, fault);
                    last_error = Some(ErrorDetail::from_fault(&fault));
                }
                Err(_) => {
                    // A source cut short by the caller's budget did not get its full timeout.
                    if timeout >= fetch_timeout {
                        self.health.record_error_as(id, ErrorCategory::Timeout);
                    }
                    self.record(id, CallOutcome::Timeout, elapsed);
                    warn!("data source {} timed out after {:?}", id, timeout);
                    last_error = Some(ErrorDetail::new(
                        ErrorCategory::Timeout,
                        format!("{id} timed out after {timeout:?}"),
                    ));
                }
            }
        }

        let elapsed = started.elapsed();
        warn!(
            "all data sources exhausted for '{}' after {:?} (attempted {}, skipped {})",
            query.query_type,
            elapsed,
            attempted.len(),
            skipped.len()
        );
        Err(RouterError::Exhausted {
            query_type: query.query_type.clone(),
            attempted,
            skipped,
            last_error,
            elapsed,
        })
    }

    fn record(&self, source: &str, outcome: CallOutcome, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.record_source_query(source, outcome, elapsed);
        }
    }

    /// Check every source and feed the outcome into the health tracker.
    pub async fn health_check_all(&self) -> BTreeMap<String, bool> {
        let timeout = self.config.fetch_timeout();
        let mut outcome = BTreeMap::new();

        for source in &self.sources {
            let id = source.id();
            let healthy = tokio::time::timeout(timeout, source.health_check())
                .await
                .unwrap_or(false);

            if healthy {
                self.health.record_success(id);
            } else {
                self.health.record_error_as(id, ErrorCategory::Network);
            }
            outcome.insert(id.to_string(), healthy);
        }

        outcome
    }

    /// Health records of the configured sources, in try order
    pub fn source_status(&self) -> Vec<WorkerHealthRecord> {
        self.sources
            .iter()
            .filter_map(|s| self.health.snapshot(s.id()))
            .collect()
    }
}

impl Drop for DataSourceRouter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
