//! Scout - Query Orchestration Core
//!
//! Scout answers free-text questions about live streams by classifying the
//! intent, fanning the work out to specialized workers in dependency tiers,
//! and merging whatever comes back into one answer. Failing backends are
//! isolated by per-entity circuit breakers, data fetches fail over across
//! prioritized sources, and answers are cached with a TTL.
//!
//! # Architecture
//!
//! - `intent` - Primary classifier with keyword-rule fallback
//! - `orchestration` - Planner, executor, aggregator and the orchestrator itself
//! - `router` - Prioritized data sources with failover
//! - `health` - Per-entity health tracking and circuit breaking
//! - `cache` - TTL + LRU response cache
//! - `metrics` - Prometheus counters and per-operation latency summaries
//! - `fault` - Fault classification into stable categories
//! - `config` - TOML configuration with environment overrides
//! - `telemetry` - Tracing subscriber setup
//! - `demo` - In-process sources and workers for the CLI

pub mod cache;
pub mod config;
pub mod demo;
pub mod error;
pub mod fault;
pub mod health;
pub mod intent;
pub mod metrics;
pub mod orchestration;
pub mod router;
pub mod telemetry;

pub use cache::{CacheKey, ResponseCache};
pub use config::ScoutConfig;
pub use error::{ConfigError, Result, ScoutError};
pub use fault::{ErrorCategory, ErrorDetail, Fault};
pub use health::{HealthStatus, HealthTracker};
pub use intent::{Intent, IntentClassifier, IntentKind, PrimaryClassifier};
pub use metrics::{Metrics, PerformanceReport};
pub use orchestration::{Orchestrator, OrchestratorResponse, Query, Worker};
pub use router::{DataSource, DataSourceRouter};

/// Scout version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
