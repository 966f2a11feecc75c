//! End-to-end tests for the orchestrator
//!
//! Tests cover:
//! - Greeting answered without dispatching any worker
//! - Partial failure inside a tier
//! - Primary classifier below threshold
//! - Circuit opening, skipping, and recovery after cooldown
//! - Answer caching and the no-negative-caching rule
//! - Background purge of expired answers
//! - Worker latency in the health report
//! - Request deadline

mod common;

use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use common::{Behavior, ScriptedPrimary, ScriptedWorker, connection_refused, orchestrator};
use scout::config::ScoutConfig;
use scout::fault::ErrorCategory;
use scout::health::HealthStatus;
use scout::intent::{IntentKind, Provenance};
use scout::orchestration::Query;

fn briefing_workers(trending: Behavior) -> Vec<std::sync::Arc<ScriptedWorker>> {
    vec![
        ScriptedWorker::new(
            "live_monitor",
            &["get_live_streams"],
            Behavior::Succeed(json!({ "streams": [
                { "user_name": "Uzi", "viewer_count": 200000, "game_name": "英雄联盟" }
            ]})),
        ),
        ScriptedWorker::new("data_source", &["get_trending"], trending),
        ScriptedWorker::new("briefing", &["summarize"], Behavior::Echo),
    ]
}

// ============================================================================
// Classification paths
// ============================================================================

#[tokio::test]
async fn test_greeting_without_primary() {
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, None);

    let response = orchestrator.handle(&Query::new("hello")).await;

    assert_eq!(response.intent.kind, IntentKind::Greeting);
    assert_eq!(response.intent.provenance, Provenance::Rule);
    assert!((response.intent.confidence - 0.95).abs() < f32::EPSILON);
    assert!(response.result.success);
    assert!(response.result.payload.is_empty());
    assert!(workers.iter().all(|w| w.calls() == 0));
}

#[tokio::test]
async fn test_low_confidence_primary_falls_back_to_rules() {
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let primary = ScriptedPrimary::new("status", 0.5);
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, Some(primary));

    let response = orchestrator.handle(&Query::new("generate a report")).await;

    assert_eq!(response.intent.kind, IntentKind::Briefing);
    assert_eq!(response.intent.provenance, Provenance::Rule);
    assert!((response.intent.confidence - 0.85).abs() < f32::EPSILON);
}

#[tokio::test]
async fn test_confident_primary_is_used() {
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let primary = ScriptedPrimary::new("briefing", 0.92);
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, Some(primary));

    let response = orchestrator.handle(&Query::new("what happened in the scene")).await;

    assert_eq!(response.intent.kind, IntentKind::Briefing);
    assert_eq!(response.intent.provenance, Provenance::Primary);
    assert!(response.result.success);
}

#[tokio::test]
async fn test_unknown_intent_is_unhandled() {
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &[], None);

    let response = orchestrator.handle(&Query::new("qwzx")).await;

    assert_eq!(response.intent.kind, IntentKind::Unknown);
    assert!(!response.result.success);
    assert_eq!(
        response.result.error.unwrap().category,
        ErrorCategory::Validation
    );
}

// ============================================================================
// Partial failure and tiers
// ============================================================================

#[tokio::test]
async fn test_partial_failure_in_tier() {
    let workers = briefing_workers(Behavior::Fail(connection_refused));
    let (orchestrator, health) = orchestrator(ScoutConfig::default(), &workers, None);

    let response = orchestrator.handle(&Query::new("daily briefing please")).await;
    let result = &response.result;

    assert!(result.success);
    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].worker, "data_source");
    assert_eq!(result.failures[0].error.category, ErrorCategory::Network);
    assert_eq!(result.contributors, vec!["live_monitor", "briefing"]);

    // Tier 2 saw the tier-1 stream count.
    assert_eq!(result.payload["summary"]["live_count"], json!(1));
    assert_eq!(result.payload["live_data"]["total_viewers"], json!(200000));

    assert_eq!(
        health.snapshot("data_source").unwrap().status,
        HealthStatus::Degraded
    );
}

#[tokio::test]
async fn test_all_workers_failing() {
    let workers = vec![ScriptedWorker::new(
        "live_monitor",
        &["get_live_streams"],
        Behavior::Fail(connection_refused),
    )];
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, None);

    let response = orchestrator.handle(&Query::new("who is live")).await;

    assert!(!response.result.success);
    let error = response.result.error.unwrap();
    assert_eq!(error.category, ErrorCategory::Network);
    assert!(error.message.contains("live_monitor"));
}

// ============================================================================
// Circuit breaking
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_circuit_opens_and_recovers() {
    let system = ScriptedWorker::new("system", &["report"], Behavior::Fail(connection_refused));
    let (orchestrator, health) =
        orchestrator(ScoutConfig::default(), &[system.clone()], None);

    for _ in 0..5 {
        let response = orchestrator.handle(&Query::new("status")).await;
        assert!(!response.result.success);
    }
    assert_eq!(system.calls(), 5);
    assert_eq!(health.snapshot("system").unwrap().status, HealthStatus::Failed);

    // Open circuit: skipped without being invoked.
    let response = orchestrator.handle(&Query::new("status")).await;
    assert!(!response.result.success);
    assert_eq!(system.calls(), 5);
    assert_eq!(
        response.result.failures[0].error.category,
        ErrorCategory::UpstreamApi
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    system.set_behavior(Behavior::Succeed(json!({ "components": [] })));

    let response = orchestrator.handle(&Query::new("status")).await;
    assert!(response.result.success);
    assert_eq!(system.calls(), 6);
    assert_eq!(health.snapshot("system").unwrap().status, HealthStatus::Healthy);
}

// ============================================================================
// Caching
// ============================================================================

#[tokio::test]
async fn test_repeated_query_served_from_cache() {
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": ["a"] })));
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, None);

    let first = orchestrator.handle(&Query::new("Daily  Briefing")).await;
    let second = orchestrator.handle(&Query::new("daily briefing")).await;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(first.result, second.result);
    assert_eq!(workers[0].calls(), 1);

    orchestrator.clear_cache();
    let third = orchestrator.handle(&Query::new("daily briefing")).await;
    assert!(!third.cached);
}

#[tokio::test]
async fn test_failures_are_not_cached() {
    let live = ScriptedWorker::new(
        "live_monitor",
        &["get_live_streams"],
        Behavior::Fail(connection_refused),
    );
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &[live.clone()], None);

    orchestrator.handle(&Query::new("who is live")).await;
    let second = orchestrator.handle(&Query::new("who is live")).await;

    assert!(!second.cached);
    assert_eq!(live.calls(), 2);
}

#[tokio::test]
async fn test_cache_context_fields_split_keys() {
    let mut config = ScoutConfig::default();
    config.orchestrator.cache_context_fields = vec!["locale".to_string()];
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let (orchestrator, _) = orchestrator(config, &workers, None);

    orchestrator
        .handle(&Query::new("daily briefing").with_metadata("locale", "en"))
        .await;
    let other_locale = orchestrator
        .handle(&Query::new("daily briefing").with_metadata("locale", "zh"))
        .await;

    assert!(!other_locale.cached);
    assert_eq!(workers[0].calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_purges_expired_answers() {
    let mut config = ScoutConfig::default();
    config.cache.query_ttl_secs = 1;
    config.cache.sweep_interval_secs = 1;
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let (orchestrator, _) = orchestrator(config, &workers, None);

    assert!(orchestrator.handle(&Query::new("daily briefing")).await.result.success);
    assert_eq!(orchestrator.cache().len(), 1);

    // Nobody reads the entry again; only the background purge can drop it.
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(orchestrator.cache().len(), 0);
    let stats = orchestrator.cache().stats();
    assert_eq!(stats.expirations, 1);
    assert_eq!(stats.misses, 1);
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_disabled_keeps_expired_answers_until_read() {
    let mut config = ScoutConfig::default();
    config.cache.query_ttl_secs = 1;
    config.cache.sweep_interval_secs = 0;
    let workers = briefing_workers(Behavior::Succeed(json!({ "trends": [] })));
    let (orchestrator, _) = orchestrator(config, &workers, None);

    orchestrator.handle(&Query::new("daily briefing")).await;
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    assert_eq!(orchestrator.cache().len(), 1);
}

// ============================================================================
// Health report
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_health_report_includes_worker_latency() {
    let workers = briefing_workers(Behavior::Fail(connection_refused));
    let (orchestrator, _) = orchestrator(ScoutConfig::default(), &workers, None);

    orchestrator.handle(&Query::new("daily briefing")).await;

    let report = orchestrator.health_report();
    let names: Vec<&str> = report
        .performance
        .operations
        .iter()
        .map(|op| op.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "worker:briefing.summarize",
            "worker:data_source.get_trending",
            "worker:live_monitor.get_live_streams",
        ]
    );

    let trending = &report.performance.operations[1];
    assert_eq!(trending.count, 1);
    assert_eq!(trending.errors, 1);

    let text = orchestrator.metrics().encode().unwrap();
    assert!(text.lines().any(|l| l.starts_with("scout_requests_total{")
        && l.contains(r#"intent="briefing""#)
        && l.contains(r#"status="success""#)));
}

// ============================================================================
// Deadline
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_deadline_abandons_outstanding_tasks() {
    let mut config = ScoutConfig::default();
    config.orchestrator.request_deadline_ms = 1_000;
    let workers = briefing_workers(Behavior::Hang);
    workers[0].set_behavior(Behavior::Hang);
    let (orchestrator, health) = orchestrator(config, &workers, None);

    let started = Instant::now();
    let response = orchestrator.handle(&Query::new("daily briefing")).await;

    assert!(started.elapsed() <= Duration::from_millis(1_100));
    assert!(!response.result.success);
    assert_eq!(response.result.failures.len(), 3);
    assert!(
        response
            .result
            .failures
            .iter()
            .all(|f| f.error.category == ErrorCategory::Timeout)
    );
    assert_eq!(workers[2].calls(), 0);

    // Abandoned work is not held against the workers.
    assert_eq!(
        health.snapshot("live_monitor").unwrap().consecutive_errors,
        0
    );
}
