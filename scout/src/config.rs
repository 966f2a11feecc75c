//! Configuration
//!
//! One TOML document with a section per component. Every field has a
//! default, so an empty file (or none at all) yields a working setup.
//! Environment variables override a handful of operational knobs.
//!
//! ```toml
//! [health]
//! max_errors = 5
//! cooldown_secs = 60
//!
//! [executor]
//! max_concurrency = 3
//!
//! [metrics]
//! slow_call_threshold_ms = 3000
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::health::HealthConfig;
use crate::intent::ClassifierConfig;
use crate::metrics::MetricsConfig;
use crate::orchestration::{AggregatorConfig, ExecutorConfig, OrchestratorConfig, PlannerConfig};
use crate::router::RouterConfig;

pub const ENV_MAX_ERRORS: &str = "SCOUT_MAX_ERRORS";
pub const ENV_COOLDOWN_SECS: &str = "SCOUT_COOLDOWN_SECS";
pub const ENV_CACHE_CAPACITY: &str = "SCOUT_CACHE_CAPACITY";
pub const ENV_MAX_CONCURRENCY: &str = "SCOUT_MAX_CONCURRENCY";
pub const ENV_CONFIDENCE_THRESHOLD: &str = "SCOUT_CONFIDENCE_THRESHOLD";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoutConfig {
    pub health: HealthConfig,
    pub cache: CacheConfig,
    pub router: RouterConfig,
    pub classifier: ClassifierConfig,
    pub planner: PlannerConfig,
    pub executor: ExecutorConfig,
    pub aggregator: AggregatorConfig,
    pub orchestrator: OrchestratorConfig,
    pub metrics: MetricsConfig,
}

impl ScoutConfig {
    /// Parse and validate a TOML document, without environment overrides.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, apply environment overrides, then validate.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        debug!("Loading configuration from: {}", path.display());

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;

        let mut config: Self = toml::from_str(&content)?;
        config.merge_env_vars()?;
        config.validate()?;

        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn merge_env_vars(&mut self) -> Result<(), ConfigError> {
        self.merge_env_with(|var| std::env::var(var).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn merge_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_env(&lookup, ENV_MAX_ERRORS)? {
            debug!("Overriding health.max_errors from environment: {}", value);
            self.health.max_errors = value;
        }

        if let Some(value) = parse_env(&lookup, ENV_COOLDOWN_SECS)? {
            debug!("Overriding health.cooldown_secs from environment: {}", value);
            self.health.cooldown_secs = value;
        }

        if let Some(value) = parse_env(&lookup, ENV_CACHE_CAPACITY)? {
            debug!("Overriding cache.capacity from environment: {}", value);
            self.cache.capacity = value;
        }

        if let Some(value) = parse_env(&lookup, ENV_MAX_CONCURRENCY)? {
            debug!("Overriding executor.max_concurrency from environment: {}", value);
            self.executor.max_concurrency = value;
        }

        if let Some(value) = parse_env(&lookup, ENV_CONFIDENCE_THRESHOLD)? {
            debug!(
                "Overriding classifier.confidence_threshold from environment: {}",
                value
            );
            self.classifier.confidence_threshold = value;
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.max_errors == 0 {
            return Err(ConfigError::Invalid(
                "health.max_errors must be greater than 0".to_string(),
            ));
        }

        if self.cache.capacity == 0 || self.cache.source_capacity == 0 {
            return Err(ConfigError::Invalid(
                "cache capacities must be greater than 0".to_string(),
            ));
        }

        if self.executor.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "executor.max_concurrency must be greater than 0".to_string(),
            ));
        }

        let threshold = self.classifier.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "classifier.confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }

        // A source attempt that outlives its task leaves no time to fail over.
        if self.router.fetch_timeout_ms == 0
            || self.router.fetch_timeout_ms >= self.planner.default_task_timeout_ms
        {
            return Err(ConfigError::Invalid(format!(
                "router.fetch_timeout_ms must be between 1 and planner.default_task_timeout_ms ({}), got {}",
                self.planner.default_task_timeout_ms, self.router.fetch_timeout_ms
            )));
        }

        if self.metrics.slow_log_capacity == 0 || self.metrics.latency_window == 0 {
            return Err(ConfigError::Invalid(
                "metrics.slow_log_capacity and metrics.latency_window must be greater than 0"
                    .to_string(),
            ));
        }

        if self.orchestrator.request_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.request_deadline_ms must be greater than 0".to_string(),
            ));
        }

        if let Some(task) = self
            .planner
            .rules
            .iter()
            .flat_map(|rule| rule.tasks.iter())
            .find(|task| task.tier == 0)
        {
            return Err(ConfigError::Invalid(format!(
                "task {}.{} has tier 0; tiers start at 1",
                task.worker, task.operation
            )));
        }

        Ok(())
    }
}

fn parse_env<T, F>(lookup: &F, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env { var, value: raw }),
    }
}
