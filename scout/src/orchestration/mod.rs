//! Orchestration Engine
//!
//! Turns a free-text query into one aggregated answer: cache lookup, intent
//! classification, tiered planning, bounded fan-out to workers, and merge.
//!
//! # Features
//!
//! - Whole-answer caching keyed on normalized text
//! - Request deadline enforced through a cancellation token
//! - Circuit-broken workers skipped without failing the request
//! - Partial answers when some workers fail
//! - Health, cache and latency report for operators
//! - Background purge of expired answers

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

pub mod aggregator;
pub mod executor;
pub mod planner;
pub mod registry;

pub use aggregator::*;
pub use executor::*;
pub use planner::*;
pub use registry::*;

use crate::cache::{CacheKey, CacheStats, ResponseCache};
use crate::config::ScoutConfig;
use crate::error::ScoutError;
use crate::fault::{ErrorCategory, ErrorDetail};
use crate::health::{HealthTracker, WorkerHealthRecord};
use crate::intent::{Intent, IntentClassifier, PrimaryClassifier};
use crate::metrics::{Metrics, PerformanceReport};
use crate::router::DataSourceRouter;

// ============================================================================
// Errors
// ============================================================================

/// Planning-time failures
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("unknown worker: {worker}")]
    UnknownWorker { worker: String },

    #[error("worker {worker} does not support operation {operation}")]
    UnknownOperation { worker: String, operation: String },

    #[error("worker already registered: {worker}")]
    DuplicateWorker { worker: String },
}

// ============================================================================
// Queries and responses
// ============================================================================

/// Incoming request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: Uuid,
    pub text: String,
    pub requester: Option<String>,
    pub session: Option<String>,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Query {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            requester: None,
            session: None,
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResponse {
    pub query_id: Uuid,
    pub intent: Intent,
    pub result: AggregatedResult,
    pub cached: bool,
    pub elapsed: Duration,
}

/// What the answer cache stores
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub intent: Intent,
    pub result: AggregatedResult,
}

/// Operator view of worker, source and cache state
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub workers: Vec<WorkerHealthRecord>,
    pub sources: Vec<WorkerHealthRecord>,
    pub cache: CacheStats,
    pub performance: PerformanceReport,
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Budget for one request end to end
    pub request_deadline_ms: u64,

    /// Query metadata fields that take part in the cache key
    pub cache_context_fields: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            request_deadline_ms: 30_000,
            cache_context_fields: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms)
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Main entry point for answering queries
pub struct Orchestrator {
    classifier: IntentClassifier,
    planner: TaskPlanner,
    executor: ConcurrentExecutor,
    aggregator: ResultAggregator,
    cache: Arc<ResponseCache<CachedAnswer>>,
    health: Arc<HealthTracker>,
    router: Option<Arc<DataSourceRouter>>,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<Metrics>,
    sweeper: Option<JoinHandle<()>>,
    query_ttl: Duration,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn builder(config: ScoutConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    pub async fn handle(&self, query: &Query) -> OrchestratorResponse {
        let cancel = CancellationToken::new();
        let deadline = self.config.request_deadline();

        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                warn!("request deadline of {:?} reached", deadline);
                cancel.cancel();
            })
        };

        let response = self.handle_with_cancel(query, cancel).await;
        timer.abort();
        response
    }

    /// Answer `query`, abandoning outstanding work once `cancel` fires.
    pub async fn handle_with_cancel(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> OrchestratorResponse {
        let started = Instant::now();
        let key = CacheKey::for_query(&query.text, &self.cache_context(query));

        let hit = self.cache.get(&key);
        self.metrics.record_cache_lookup("answer", hit.is_some());
        if let Some(hit) = hit {
            info!("query {} answered from cache", query.id);
            self.metrics.record_request(hit.intent.kind.as_str(), true);
            return OrchestratorResponse {
                query_id: query.id,
                intent: hit.intent,
                result: hit.result,
                cached: true,
                elapsed: started.elapsed(),
            };
        }

        let intent = self.classifier.classify_with_cancel(&query.text, &cancel).await;

        let result = match self.planner.plan(&intent) {
            Ok(plan) if !plan.handled => AggregatedResult::unhandled(&intent),
            Ok(plan) => {
                let results = self.executor.execute(&plan, &cancel).await;
                self.aggregator.aggregate(&intent, &results)
            }
            Err(err) => {
                warn!("planning failed for {}: {}", intent.kind, err);
                AggregatedResult::failed(
                    &intent,
                    ErrorDetail::new(ErrorCategory::Internal, "no valid plan for this request"),
                )
            }
        };

        if result.success {
            self.cache.set(
                key,
                CachedAnswer {
                    intent: intent.clone(),
                    result: result.clone(),
                },
                self.query_ttl,
            );
        }

        self.metrics.record_request(intent.kind.as_str(), result.success);
        let elapsed = started.elapsed();
        info!(
            "query {} handled as {} in {:?} (success={}, {} failures)",
            query.id,
            intent.kind,
            elapsed,
            result.success,
            result.failures.len()
        );

        OrchestratorResponse {
            query_id: query.id,
            intent,
            result,
            cached: false,
            elapsed,
        }
    }

    fn cache_context(&self, query: &Query) -> BTreeMap<String, String> {
        self.config
            .cache_context_fields
            .iter()
            .filter_map(|field| {
                query
                    .metadata
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect()
    }

    pub fn health_report(&self) -> HealthReport {
        let worker_ids = self.registry.ids();
        HealthReport {
            workers: worker_ids
                .iter()
                .filter_map(|id| self.health.snapshot(id))
                .collect(),
            sources: self
                .router
                .as_ref()
                .map(|r| r.source_status())
                .unwrap_or_default(),
            cache: self.cache.stats(),
            performance: self.metrics.report(),
            generated_at: Utc::now(),
        }
    }

    /// Run every data source's health check, feeding the health tracker.
    ///
    /// Empty when no router is wired.
    pub async fn check_sources(&self) -> BTreeMap<String, bool> {
        match &self.router {
            Some(router) => router.health_check_all().await,
            None => BTreeMap::new(),
        }
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
        info!("answer cache cleared");
    }

    pub fn cache(&self) -> &Arc<ResponseCache<CachedAnswer>> {
        &self.cache
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Wires the orchestrator from its explicit dependencies.
pub struct OrchestratorBuilder {
    config: ScoutConfig,
    registry: WorkerRegistry,
    health: Option<Arc<HealthTracker>>,
    cache: Option<Arc<ResponseCache<CachedAnswer>>>,
    router: Option<Arc<DataSourceRouter>>,
    metrics: Option<Arc<Metrics>>,
    primary: Option<Arc<dyn PrimaryClassifier>>,
}

impl OrchestratorBuilder {
    pub fn new(config: ScoutConfig) -> Self {
        Self {
            config,
            registry: WorkerRegistry::new(),
            health: None,
            cache: None,
            router: None,
            metrics: None,
            primary: None,
        }
    }

    pub fn worker(mut self, worker: Arc<dyn Worker>) -> Result<Self, PlanError> {
        self.registry.register(worker)?;
        Ok(self)
    }

    pub fn health(mut self, health: Arc<HealthTracker>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn cache(mut self, cache: Arc<ResponseCache<CachedAnswer>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn router(mut self, router: Arc<DataSourceRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Share a metrics registry, e.g. with the router.
    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn primary(mut self, primary: Arc<dyn PrimaryClassifier>) -> Self {
        self.primary = Some(primary);
        self
    }

    /// Fails only when a fresh metrics registry cannot be set up.
    ///
    /// Starts the answer cache sweeper when called inside a runtime.
    pub fn build(self) -> Result<Orchestrator, ScoutError> {
        let config = self.config;
        let registry = Arc::new(self.registry);

        let health = self
            .health
            .unwrap_or_else(|| Arc::new(HealthTracker::new(&config.health)));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(ResponseCache::new(
                config.cache.capacity,
                Duration::from_secs(config.cache.query_ttl_secs),
            ))
        });

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(Metrics::new(&config.metrics)?),
        };
        let sweeper =
            cache.start_sweeper(Duration::from_secs(config.cache.sweep_interval_secs));

        let mut classifier = IntentClassifier::new(config.classifier.clone());
        if let Some(primary) = self.primary {
            classifier = classifier.with_primary(primary);
        }

        let planner = TaskPlanner::new(&config.planner, registry.clone());
        if let Err(err) = planner.validate() {
            // Intents whose tasks cannot be resolved fail at plan time.
            warn!("plan table does not match registered workers: {}", err);
        }

        let executor = ConcurrentExecutor::new(registry.clone(), health.clone(), &config.executor)
            .with_metrics(metrics.clone());

        Ok(Orchestrator {
            classifier,
            planner,
            executor,
            aggregator: ResultAggregator::new(config.aggregator.clone()),
            query_ttl: cache.default_ttl(),
            cache,
            health,
            router: self.router,
            registry,
            metrics,
            sweeper,
            config: config.orchestrator,
        })
    }
}
