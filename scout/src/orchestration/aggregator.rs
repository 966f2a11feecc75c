//! Result Aggregator
//!
//! Merges task results into one answer for the caller. Successful payloads
//! are grouped by the category their task feeds; failures are reported with
//! a stable category and short reason, never dropped silently.
//!
//! Success policy: the answer fails when a required task failed, or when at
//! least one task ran and none succeeded. A handled intent with no tasks
//! (a greeting, say) succeeds with an empty payload.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::executor::TaskResult;
use crate::fault::{ErrorCategory, ErrorDetail};
use crate::intent::{Intent, IntentKind};

const LIVE_DATA: &str = "live_data";
const TREND_DATA: &str = "trend_data";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub top_streams: usize,
    pub top_trends: usize,
    pub top_games: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            top_streams: 10,
            top_trends: 5,
            top_games: 5,
        }
    }
}

/// A task that did not contribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedWorker {
    pub worker: String,
    pub operation: String,
    pub error: ErrorDetail,
}

/// Merged answer for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedResult {
    pub intent: IntentKind,
    pub success: bool,
    pub payload: BTreeMap<String, Value>,

    /// Workers whose results were merged, in plan order
    pub contributors: Vec<String>,

    pub failures: Vec<FailedWorker>,
    pub error: Option<ErrorDetail>,
}

impl AggregatedResult {
    /// Failed answer for an intent nothing is planned for.
    pub fn unhandled(intent: &Intent) -> Self {
        Self::failed(
            intent,
            ErrorDetail::new(
                ErrorCategory::Validation,
                format!("no handler for intent '{}'", intent.kind),
            ),
        )
    }

    pub fn failed(intent: &Intent, error: ErrorDetail) -> Self {
        Self {
            intent: intent.kind,
            success: false,
            payload: BTreeMap::new(),
            contributors: Vec::new(),
            failures: Vec::new(),
            error: Some(error),
        }
    }
}

pub struct ResultAggregator {
    config: AggregatorConfig,
}

impl ResultAggregator {
    pub fn new(config: AggregatorConfig) -> Self {
        Self { config }
    }

    pub fn aggregate(&self, intent: &Intent, results: &[TaskResult]) -> AggregatedResult {
        let mut contributors: Vec<String> = Vec::new();
        let mut failures = Vec::new();
        let mut by_category: BTreeMap<&str, Vec<&Value>> = BTreeMap::new();

        for result in results {
            match (&result.payload, result.success) {
                (Some(payload), true) => {
                    if !contributors.contains(&result.worker) {
                        contributors.push(result.worker.clone());
                    }
                    by_category
                        .entry(result.category.as_str())
                        .or_default()
                        .push(payload);
                }
                _ => failures.push(FailedWorker {
                    worker: result.worker.clone(),
                    operation: result.operation.clone(),
                    error: result.error.clone().unwrap_or_else(|| {
                        ErrorDetail::new(ErrorCategory::Unknown, "no result produced")
                    }),
                }),
            }
        }

        let succeeded = results.iter().filter(|r| r.success).count();
        let required_failed = results.iter().any(|r| r.required && !r.success);
        let success = !required_failed && (results.is_empty() || succeeded > 0);

        let payload = match intent.kind {
            IntentKind::LiveQuery => self.merge_live_query(intent, &by_category),
            IntentKind::Briefing => self.merge_briefing(&by_category),
            _ => merge_generic(&by_category),
        };

        let error = (!success).then(|| failure_summary(&failures));

        debug!(
            "aggregated {} results for {}: {} succeeded, success={}",
            results.len(),
            intent.kind,
            succeeded,
            success
        );

        AggregatedResult {
            intent: intent.kind,
            success,
            payload,
            contributors,
            failures,
            error,
        }
    }

    fn merge_live_query(
        &self,
        intent: &Intent,
        by_category: &BTreeMap<&str, Vec<&Value>>,
    ) -> BTreeMap<String, Value> {
        let mut payload = merge_generic(by_category);

        if let Some(sources) = by_category.get(LIVE_DATA) {
            let mut streams = collect_items(sources, "streams");
            if let Some(streamer) = intent.entity("streamer") {
                streams.retain(|s| stream_matches(s, streamer));
                payload.insert("streamer".into(), json!(streamer));
            }
            payload.insert(LIVE_DATA.into(), self.summarize_streams(streams));
        }

        payload
    }

    fn merge_briefing(&self, by_category: &BTreeMap<&str, Vec<&Value>>) -> BTreeMap<String, Value> {
        let mut payload = merge_generic(by_category);

        if let Some(sources) = by_category.get(LIVE_DATA) {
            let streams = collect_items(sources, "streams");
            payload.insert(LIVE_DATA.into(), self.summarize_streams(streams));
        }

        if let Some(sources) = by_category.get(TREND_DATA) {
            let mut trends = collect_items(sources, "trends");
            trends.truncate(self.config.top_trends);
            payload.insert(TREND_DATA.into(), json!({ "trends": trends }));
        }

        payload
    }

    /// Dedup, rank and total a set of stream records.
    fn summarize_streams(&self, streams: Vec<Value>) -> Value {
        let mut unique: Vec<Value> = Vec::with_capacity(streams.len());
        let mut index: HashMap<String, usize> = HashMap::new();

        for stream in streams {
            let Some(key) = stream_key(&stream) else {
                unique.push(stream);
                continue;
            };
            match index.get(&key).copied() {
                Some(at) if viewers(&stream) > viewers(&unique[at]) => unique[at] = stream,
                Some(_) => {}
                None => {
                    index.insert(key, unique.len());
                    unique.push(stream);
                }
            }
        }

        unique.sort_by(|a, b| match viewers(b).cmp(&viewers(a)) {
            Ordering::Equal => stream_key(a).cmp(&stream_key(b)),
            other => other,
        });

        let total_viewers: u64 = unique.iter().map(viewers).sum();
        let total_streamers = unique.len();

        let mut games: HashMap<String, u64> = HashMap::new();
        for stream in &unique {
            if let Some(game) = stream.get("game_name").and_then(Value::as_str) {
                *games.entry(game.to_string()).or_default() += viewers(stream);
            }
        }
        let mut top_games: Vec<(String, u64)> = games.into_iter().collect();
        top_games.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_games.truncate(self.config.top_games);

        unique.truncate(self.config.top_streams);

        json!({
            "streams": unique,
            "total_viewers": total_viewers,
            "total_streamers": total_streamers,
            "top_games": top_games
                .into_iter()
                .map(|(game, viewers)| json!({ "game": game, "viewers": viewers }))
                .collect::<Vec<_>>(),
        })
    }
}

impl Default for ResultAggregator {
    fn default() -> Self {
        Self::new(AggregatorConfig::default())
    }
}

/// One entry per category: the payload itself, or an array when several tasks fed it.
fn merge_generic(by_category: &BTreeMap<&str, Vec<&Value>>) -> BTreeMap<String, Value> {
    by_category
        .iter()
        .map(|(category, values)| {
            let merged = match values.as_slice() {
                [single] => (*single).clone(),
                many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
            };
            (category.to_string(), merged)
        })
        .collect()
}

/// Items of `field` across payloads; bare arrays are accepted too.
fn collect_items(payloads: &[&Value], field: &str) -> Vec<Value> {
    payloads
        .iter()
        .flat_map(|payload| match payload {
            Value::Array(items) => items.clone(),
            other => other
                .get(field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

fn stream_key(stream: &Value) -> Option<String> {
    ["user_login", "user_name"]
        .iter()
        .find_map(|field| stream.get(field).and_then(Value::as_str))
        .map(str::to_lowercase)
}

fn stream_matches(stream: &Value, streamer: &str) -> bool {
    let wanted = streamer.to_lowercase();
    ["user_login", "user_name"].iter().any(|field| {
        stream
            .get(field)
            .and_then(Value::as_str)
            .is_some_and(|name| name.to_lowercase() == wanted)
    })
}

fn viewers(stream: &Value) -> u64 {
    stream
        .get("viewer_count")
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

fn failure_summary(failures: &[FailedWorker]) -> ErrorDetail {
    let Some(first) = failures.first() else {
        return ErrorDetail::new(ErrorCategory::Unknown, "no worker produced a result");
    };

    let category = if failures.iter().all(|f| f.error.category == first.error.category) {
        first.error.category
    } else {
        ErrorCategory::UpstreamApi
    };

    let reasons = failures
        .iter()
        .map(|f| format!("{}: {}", f.worker, f.error.message))
        .collect::<Vec<_>>()
        .join("; ");

    ErrorDetail::new(category, reasons)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Provenance;

    fn intent(kind: IntentKind, streamer: Option<&str>) -> Intent {
        let mut entities = BTreeMap::new();
        if let Some(name) = streamer {
            entities.insert("streamer".to_string(), name.to_string());
        }
        Intent {
            kind,
            confidence: 0.85,
            entities,
            provenance: Provenance::Rule,
        }
    }

    fn ok(worker: &str, category: &str, payload: Value) -> TaskResult {
        TaskResult::for_test(worker, category, Some(payload))
    }

    fn failed(worker: &str, category: &str) -> TaskResult {
        TaskResult::for_test(worker, category, None)
    }

    #[test]
    fn test_dedup_keeps_higher_viewer_count() {
        let aggregator = ResultAggregator::default();
        let results = vec![
            ok(
                "live_monitor",
                LIVE_DATA,
                json!({ "streams": [
                    { "user_login": "uzi", "viewer_count": 100, "game_name": "LoL" },
                    { "user_login": "faker", "viewer_count": 500, "game_name": "LoL" },
                ]}),
            ),
            ok(
                "data_source",
                LIVE_DATA,
                json!([{ "user_login": "Uzi", "viewer_count": 300, "game_name": "LoL" }]),
            ),
        ];

        let answer = aggregator.aggregate(&intent(IntentKind::Briefing, None), &results);
        let live = &answer.payload[LIVE_DATA];

        assert!(answer.success);
        assert_eq!(live["total_streamers"], json!(2));
        assert_eq!(live["total_viewers"], json!(800));
        assert_eq!(live["streams"][0]["user_login"], json!("faker"));
        assert_eq!(live["streams"][1]["viewer_count"], json!(300));
        assert_eq!(live["top_games"][0]["game"], json!("LoL"));
        assert_eq!(answer.contributors, vec!["live_monitor", "data_source"]);
    }

    #[test]
    fn test_partial_failure_still_succeeds() {
        let aggregator = ResultAggregator::default();
        let results = vec![
            ok("live_monitor", LIVE_DATA, json!({ "streams": [] })),
            failed("data_source", TREND_DATA),
        ];

        let answer = aggregator.aggregate(&intent(IntentKind::Briefing, None), &results);
        assert!(answer.success);
        assert!(answer.error.is_none());
        assert_eq!(answer.failures.len(), 1);
        assert_eq!(answer.failures[0].worker, "data_source");
    }

    #[test]
    fn test_all_failed_reports_union_of_reasons() {
        let aggregator = ResultAggregator::default();
        let results = vec![failed("live_monitor", LIVE_DATA), failed("data_source", TREND_DATA)];

        let answer = aggregator.aggregate(&intent(IntentKind::Briefing, None), &results);
        assert!(!answer.success);
        let error = answer.error.unwrap();
        assert!(error.message.contains("live_monitor"));
        assert!(error.message.contains("data_source"));
    }

    #[test]
    fn test_required_failure_fails_answer() {
        let aggregator = ResultAggregator::default();
        let mut required = failed("live_monitor", LIVE_DATA);
        required.required = true;
        let results = vec![required, ok("system", "system", json!({}))];

        let answer = aggregator.aggregate(&intent(IntentKind::LiveQuery, None), &results);
        assert!(!answer.success);
    }

    #[test]
    fn test_live_query_narrows_to_streamer() {
        let aggregator = ResultAggregator::default();
        let results = vec![ok(
            "live_monitor",
            LIVE_DATA,
            json!({ "streams": [
                { "user_name": "Uzi", "viewer_count": 10 },
                { "user_name": "Faker", "viewer_count": 20 },
            ]}),
        )];

        let answer = aggregator.aggregate(&intent(IntentKind::LiveQuery, Some("uzi")), &results);
        let live = &answer.payload[LIVE_DATA];
        assert_eq!(live["total_streamers"], json!(1));
        assert_eq!(live["streams"][0]["user_name"], json!("Uzi"));
    }

    #[test]
    fn test_empty_handled_intent_succeeds() {
        let answer =
            ResultAggregator::default().aggregate(&intent(IntentKind::Greeting, None), &[]);
        assert!(answer.success);
        assert!(answer.payload.is_empty());
    }

    #[test]
    fn test_truncation() {
        let aggregator = ResultAggregator::new(AggregatorConfig {
            top_streams: 2,
            top_trends: 1,
            top_games: 1,
        });
        let streams: Vec<Value> = (0..5)
            .map(|i| json!({ "user_login": format!("s{i}"), "viewer_count": i }))
            .collect();
        let results = vec![
            ok("live_monitor", LIVE_DATA, json!({ "streams": streams })),
            ok("data_source", TREND_DATA, json!({ "trends": ["a", "b", "c"] })),
        ];

        let answer = aggregator.aggregate(&intent(IntentKind::Briefing, None), &results);
        assert_eq!(answer.payload[LIVE_DATA]["streams"].as_array().unwrap().len(), 2);
        assert_eq!(answer.payload[LIVE_DATA]["total_streamers"], json!(5));
        assert_eq!(answer.payload[TREND_DATA]["trends"], json!(["a"]));
    }
}
