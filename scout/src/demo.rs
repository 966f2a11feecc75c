//! In-process demo wiring
//!
//! A fixed set of streams behind a mock data source, an always-offline
//! primary source to exercise failover, and the four workers the built-in
//! plan table refers to. Used by the `scout` binary and the integration
//! tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::cache::ResponseCache;
use crate::config::ScoutConfig;
use crate::error::Result;
use crate::fault::Fault;
use crate::health::HealthTracker;
use crate::metrics::Metrics;
use crate::orchestration::{Orchestrator, Params, Worker};
use crate::router::{DataQuery, DataSource, DataSourceRouter};

fn fixture_streams() -> Vec<Value> {
    vec![
        json!({
            "user_name": "Uzi",
            "user_login": "uzi",
            "viewer_count": 200_000,
            "title": "深夜Rank训练",
            "game_name": "英雄联盟",
            "platform": "huya",
        }),
        json!({
            "user_name": "Faker",
            "user_login": "faker",
            "viewer_count": 150_000,
            "title": "T1训练赛",
            "game_name": "英雄联盟",
            "platform": "huya",
        }),
        json!({
            "user_name": "大司马",
            "user_login": "dasima",
            "viewer_count": 80_000,
            "title": "金牌讲师在线教学",
            "game_name": "英雄联盟",
            "platform": "huya",
        }),
        json!({
            "user_name": "TheShy",
            "user_login": "theshy",
            "viewer_count": 60_000,
            "title": "上单练习",
            "game_name": "英雄联盟",
            "platform": "huya",
        }),
        json!({
            "user_name": "Doublelift",
            "user_login": "doublelift",
            "viewer_count": 12_000,
            "title": "solo queue",
            "game_name": "League of Legends",
            "platform": "twitch",
        }),
    ]
}

fn fixture_trends() -> Vec<Value> {
    ["英雄联盟", "王者荣耀", "绝地求生", "原神", "永劫无间", "CS2"]
        .iter()
        .enumerate()
        .map(|(rank, game)| json!({ "rank": rank + 1, "game": game }))
        .collect()
}

// ============================================================================
// Data sources
// ============================================================================

/// Serves the fixture data
pub struct MockStreamSource {
    id: String,
    priority: u32,
}

impl MockStreamSource {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

#[async_trait]
impl DataSource for MockStreamSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn fetch(&self, query: &DataQuery, _timeout: Duration) -> std::result::Result<Value, Fault> {
        match query.query_type.as_str() {
            "streams" => {
                let streamer = query.param_str("streamer").map(str::to_lowercase);
                let platform = query.param_str("platform");
                let streams: Vec<Value> = fixture_streams()
                    .into_iter()
                    .filter(|s| {
                        streamer.as_deref().is_none_or(|wanted| {
                            s["user_name"].as_str().map(str::to_lowercase).as_deref() == Some(wanted)
                        })
                    })
                    .filter(|s| platform.is_none_or(|p| s["platform"] == p))
                    .collect();
                Ok(json!({ "streams": streams }))
            }
            "trending" => {
                let limit = query
                    .parameters
                    .get("limit")
                    .and_then(Value::as_u64)
                    .unwrap_or(10) as usize;
                let trends: Vec<Value> = fixture_trends().into_iter().take(limit).collect();
                Ok(json!({ "trends": trends }))
            }
            other => Err(Fault::InvalidInput(format!("unsupported query type '{other}'"))),
        }
    }
}

/// A source that is never reachable
pub struct OfflineSource {
    id: String,
    priority: u32,
}

impl OfflineSource {
    pub fn new(id: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            priority,
        }
    }
}

#[async_trait]
impl DataSource for OfflineSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn fetch(&self, _query: &DataQuery, _timeout: Duration) -> std::result::Result<Value, Fault> {
        Err(Fault::Connection(format!("{} has no credentials configured", self.id)))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

// ============================================================================
// Workers
// ============================================================================

fn stream_query(params: &Params) -> DataQuery {
    let mut query = DataQuery::new("streams");
    for name in ["streamer", "platform"] {
        if let Some(value) = params.get(name).filter(|v| !v.is_null()) {
            query = query.with_param(name, value.clone());
        }
    }
    query
}

/// Tracks who is live
pub struct LiveMonitorWorker {
    router: Arc<DataSourceRouter>,
}

impl LiveMonitorWorker {
    pub fn new(router: Arc<DataSourceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Worker for LiveMonitorWorker {
    fn id(&self) -> &str {
        "live_monitor"
    }

    fn operations(&self) -> &[&'static str] {
        &["get_live_streams", "check_streamer"]
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
        timeout: Duration,
    ) -> std::result::Result<Value, Fault> {
        match operation {
            "get_live_streams" => {
                let result = self
                    .router
                    .fetch_within(&stream_query(params), Some(timeout))
                    .await?;
                Ok(json!({
                    "streams": result.data["streams"],
                    "source": result.source,
                    "cached": result.cached,
                }))
            }
            "check_streamer" => {
                let Some(streamer) = params.get("streamer").and_then(Value::as_str) else {
                    return Err(Fault::InvalidInput("missing parameter 'streamer'".into()));
                };
                let query = DataQuery::new("streams").with_param("streamer", streamer);
                let result = self.router.fetch_within(&query, Some(timeout)).await?;
                let stream = result.data["streams"]
                    .as_array()
                    .and_then(|s| s.first())
                    .cloned();
                Ok(json!({
                    "streamer": streamer,
                    "is_live": stream.is_some(),
                    "stream": stream,
                }))
            }
            other => Err(Fault::InvalidInput(format!("unknown operation '{other}'"))),
        }
    }
}

/// Platform-wide data: streams and trending games
pub struct DataSourceWorker {
    router: Arc<DataSourceRouter>,
}

impl DataSourceWorker {
    pub fn new(router: Arc<DataSourceRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Worker for DataSourceWorker {
    fn id(&self) -> &str {
        "data_source"
    }

    fn operations(&self) -> &[&'static str] {
        &["get_live_streams", "get_trending"]
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
        timeout: Duration,
    ) -> std::result::Result<Value, Fault> {
        let query = match operation {
            "get_live_streams" => stream_query(params),
            "get_trending" => {
                let limit = params.get("limit").and_then(Value::as_u64).unwrap_or(10);
                DataQuery::new("trending").with_param("limit", limit)
            }
            other => return Err(Fault::InvalidInput(format!("unknown operation '{other}'"))),
        };

        let result = self.router.fetch_within(&query, Some(timeout)).await?;
        Ok(result.data)
    }
}

/// Builds the headline of a briefing from tier-1 counts
pub struct BriefingWorker;

#[async_trait]
impl Worker for BriefingWorker {
    fn id(&self) -> &str {
        "briefing"
    }

    fn operations(&self) -> &[&'static str] {
        &["summarize"]
    }

    async fn invoke(
        &self,
        operation: &str,
        params: &Params,
        _timeout: Duration,
    ) -> std::result::Result<Value, Fault> {
        if operation != "summarize" {
            return Err(Fault::InvalidInput(format!("unknown operation '{operation}'")));
        }

        let live_count = params.get("live_count").and_then(Value::as_u64).unwrap_or(0);
        let trend_count = params.get("trend_count").and_then(Value::as_u64).unwrap_or(0);
        let time_range = params
            .get("time_range")
            .and_then(Value::as_str)
            .unwrap_or("today");

        Ok(json!({
            "time_range": time_range,
            "live_count": live_count,
            "trend_count": trend_count,
            "headline": format!("{live_count} streams live, {trend_count} trending games ({time_range})"),
        }))
    }
}

/// Reports component health
pub struct SystemWorker {
    health: Arc<HealthTracker>,
}

impl SystemWorker {
    pub fn new(health: Arc<HealthTracker>) -> Self {
        Self { health }
    }
}

#[async_trait]
impl Worker for SystemWorker {
    fn id(&self) -> &str {
        "system"
    }

    fn operations(&self) -> &[&'static str] {
        &["report"]
    }

    async fn invoke(
        &self,
        _operation: &str,
        _params: &Params,
        _timeout: Duration,
    ) -> std::result::Result<Value, Fault> {
        let components = serde_json::to_value(self.health.snapshot_all())
            .map_err(|e| Fault::Internal(e.to_string()))?;
        Ok(json!({ "components": components }))
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Router over the offline primary and the mock backup.
///
/// Starts the source cache sweeper when called inside a runtime.
pub fn build_router(config: &ScoutConfig, health: Arc<HealthTracker>) -> DataSourceRouter {
    let source_cache = Arc::new(ResponseCache::new(
        config.cache.source_capacity,
        Duration::from_secs(config.router.default_ttl_secs),
    ));

    DataSourceRouter::new(health, source_cache, config.router.clone())
        .with_source(Arc::new(OfflineSource::new("twitch_api", 1)))
        .with_source(Arc::new(MockStreamSource::new("huya_mock", 10)))
        .with_sweeper(Duration::from_secs(config.cache.sweep_interval_secs))
}

/// Orchestrator with the demo sources and workers.
pub fn build_orchestrator(config: &ScoutConfig) -> Result<Orchestrator> {
    let health = Arc::new(HealthTracker::new(&config.health));
    let metrics = Arc::new(Metrics::new(&config.metrics)?);
    let router = Arc::new(build_router(config, health.clone()).with_metrics(metrics.clone()));

    let orchestrator = Orchestrator::builder(config.clone())
        .health(health.clone())
        .metrics(metrics)
        .router(router.clone())
        .worker(Arc::new(LiveMonitorWorker::new(router.clone())))?
        .worker(Arc::new(DataSourceWorker::new(router)))?
        .worker(Arc::new(BriefingWorker))?
        .worker(Arc::new(SystemWorker::new(health)))?
        .build()?;

    Ok(orchestrator)
}
