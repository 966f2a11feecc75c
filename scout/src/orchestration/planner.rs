//! Task Planner
//!
//! Maps a classified intent to a tiered plan using a declarative table.
//! Tier 1 tasks run first; a task in tier N may reference results of earlier
//! tiers through [`ParamTemplate::FromResult`], resolved by the executor once
//! those tiers have finished.
//!
//! # Features
//!
//! - Declarative plan table, overridable from configuration
//! - Worker/operation validation against the registry at plan time
//! - Entity, literal and prior-result parameter templates
//! - Unhandled intents produce an empty, unhandled plan rather than an error

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use super::executor::TaskResult;
use super::registry::{Params, WorkerRegistry};
use super::PlanError;
use crate::intent::{Intent, IntentKind};

// ============================================================================
// Plan table
// ============================================================================

/// How a parameter value is obtained
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamTemplate {
    Literal {
        value: Value,
    },

    Entity {
        key: String,
        #[serde(default)]
        default: Option<Value>,
    },

    FromResult {
        category: String,
        #[serde(default)]
        pointer: String,
        #[serde(default)]
        reduce: Reduce,
    },
}

/// How matching prior results collapse into one parameter value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduce {
    /// The value itself, or an array when several results match
    #[default]
    Value,

    /// Total number of items across matches
    Count,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub worker: String,
    pub operation: String,

    #[serde(default)]
    pub params: BTreeMap<String, ParamTemplate>,

    #[serde(default = "default_tier")]
    pub tier: u8,

    /// Payload category the result feeds into
    pub category: String,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    #[serde(default)]
    pub required: bool,
}

fn default_tier() -> u8 {
    1
}

/// Tasks to run for one intent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRule {
    pub intent: IntentKind,
    #[serde(default)]
    pub tasks: Vec<TaskTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Timeout for tasks that do not set their own
    pub default_task_timeout_ms: u64,

    pub rules: Vec<PlanRule>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            default_task_timeout_ms: 10_000,
            rules: default_plan_table(),
        }
    }
}

fn task(worker: &str, operation: &str, category: &str, tier: u8) -> TaskTemplate {
    TaskTemplate {
        worker: worker.to_string(),
        operation: operation.to_string(),
        params: BTreeMap::new(),
        tier,
        category: category.to_string(),
        timeout_ms: None,
        required: false,
    }
}

fn entity(key: &str) -> ParamTemplate {
    ParamTemplate::Entity {
        key: key.to_string(),
        default: None,
    }
}

fn count_of(category: &str, pointer: &str) -> ParamTemplate {
    ParamTemplate::FromResult {
        category: category.to_string(),
        pointer: pointer.to_string(),
        reduce: Reduce::Count,
    }
}

/// Built-in plan table
pub fn default_plan_table() -> Vec<PlanRule> {
    let mut live = task("live_monitor", "get_live_streams", "live_data", 1);
    live.required = true;
    live.params.insert("streamer".into(), entity("streamer"));
    live.params.insert("platform".into(), entity("platform"));

    let briefing_live = task("live_monitor", "get_live_streams", "live_data", 1);

    let mut trending = task("data_source", "get_trending", "trend_data", 1);
    trending.params.insert(
        "limit".into(),
        ParamTemplate::Literal { value: json!(10) },
    );

    let mut summary = task("briefing", "summarize", "summary", 2);
    summary.params.insert("live_count".into(), count_of("live_data", "/streams"));
    summary.params.insert("trend_count".into(), count_of("trend_data", "/trends"));
    summary.params.insert(
        "time_range".into(),
        ParamTemplate::Entity {
            key: "time_range".into(),
            default: Some(json!("today")),
        },
    );

    vec![
        PlanRule {
            intent: IntentKind::LiveQuery,
            tasks: vec![live],
        },
        PlanRule {
            intent: IntentKind::Briefing,
            tasks: vec![briefing_live, trending, summary],
        },
        PlanRule {
            intent: IntentKind::Status,
            tasks: vec![task("system", "report", "system", 1)],
        },
        PlanRule {
            intent: IntentKind::Greeting,
            tasks: Vec::new(),
        },
        PlanRule {
            intent: IntentKind::Help,
            tasks: Vec::new(),
        },
    ]
}

// ============================================================================
// Plans
// ============================================================================

/// Reference to earlier-tier results, resolved between tiers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRef {
    pub category: String,
    pub pointer: String,
    pub reduce: Reduce,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Resolved(Value),
    Deferred(ResultRef),
}

/// One unit of work
#[derive(Debug, Clone, Serialize)]
pub struct TaskDescriptor {
    pub worker: String,
    pub operation: String,
    pub params: BTreeMap<String, ParamValue>,
    pub tier: u8,
    pub timeout: Duration,
    pub category: String,
    pub required: bool,
}

impl TaskDescriptor {
    pub fn has_deferred_params(&self) -> bool {
        self.params
            .values()
            .any(|p| matches!(p, ParamValue::Deferred(_)))
    }

    /// Concrete parameters, with references filled from `prior` results.
    pub fn resolve_params(&self, prior: &[TaskResult]) -> Params {
        self.params
            .iter()
            .map(|(name, value)| {
                let resolved = match value {
                    ParamValue::Resolved(v) => v.clone(),
                    ParamValue::Deferred(reference) => resolve_reference(reference, prior),
                };
                (name.clone(), resolved)
            })
            .collect()
    }
}

fn resolve_reference(reference: &ResultRef, prior: &[TaskResult]) -> Value {
    let matches: Vec<&Value> = prior
        .iter()
        .filter(|r| r.success && r.category == reference.category)
        .filter_map(|r| r.payload.as_ref())
        .filter_map(|payload| {
            if reference.pointer.is_empty() {
                Some(payload)
            } else {
                payload.pointer(&reference.pointer)
            }
        })
        .collect();

    match reference.reduce {
        Reduce::Count => {
            let total: usize = matches
                .iter()
                .map(|v| match v {
                    Value::Array(items) => items.len(),
                    Value::Null => 0,
                    _ => 1,
                })
                .sum();
            json!(total)
        }
        Reduce::Value => match matches.as_slice() {
            [] => Value::Null,
            [single] => (*single).clone(),
            many => Value::Array(many.iter().map(|v| (*v).clone()).collect()),
        },
    }
}

/// Tasks sharing a tier run concurrently
#[derive(Debug, Clone, Serialize)]
pub struct Tier {
    pub level: u8,
    pub tasks: Vec<TaskDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskPlan {
    pub intent: IntentKind,

    /// False when no rule exists for the intent
    pub handled: bool,

    /// Ascending by level
    pub tiers: Vec<Tier>,
}

impl TaskPlan {
    pub fn unhandled(intent: IntentKind) -> Self {
        Self {
            intent,
            handled: false,
            tiers: Vec::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tiers.iter().map(|t| t.tasks.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.task_count() == 0
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskDescriptor> {
        self.tiers.iter().flat_map(|t| t.tasks.iter())
    }
}

// ============================================================================
// Planner
// ============================================================================

pub struct TaskPlanner {
    rules: Vec<PlanRule>,
    registry: Arc<WorkerRegistry>,
    default_timeout: Duration,
}

impl TaskPlanner {
    pub fn new(config: &PlannerConfig, registry: Arc<WorkerRegistry>) -> Self {
        Self {
            rules: config.rules.clone(),
            registry,
            default_timeout: Duration::from_millis(config.default_task_timeout_ms),
        }
    }

    /// Check every table entry against the registry.
    pub fn validate(&self) -> Result<(), PlanError> {
        for template in self.rules.iter().flat_map(|r| r.tasks.iter()) {
            self.registry
                .resolve(&template.worker, &template.operation)?;
        }
        Ok(())
    }

    pub fn plan(&self, intent: &Intent) -> Result<TaskPlan, PlanError> {
        let Some(rule) = self.rules.iter().find(|r| r.intent == intent.kind) else {
            debug!("no plan rule for intent {}", intent.kind);
            return Ok(TaskPlan::unhandled(intent.kind));
        };

        let mut tiers: BTreeMap<u8, Vec<TaskDescriptor>> = BTreeMap::new();
        for template in &rule.tasks {
            self.registry
                .resolve(&template.worker, &template.operation)?;

            let descriptor = self.instantiate(template, intent);
            tiers.entry(descriptor.tier).or_default().push(descriptor);
        }

        let plan = TaskPlan {
            intent: intent.kind,
            handled: true,
            tiers: tiers
                .into_iter()
                .map(|(level, tasks)| Tier { level, tasks })
                .collect(),
        };

        debug!(
            "planned {} tasks in {} tiers for {}",
            plan.task_count(),
            plan.tiers.len(),
            intent.kind
        );
        Ok(plan)
    }

    fn instantiate(&self, template: &TaskTemplate, intent: &Intent) -> TaskDescriptor {
        let params = template
            .params
            .iter()
            .map(|(name, param)| {
                let value = match param {
                    ParamTemplate::Literal { value } => ParamValue::Resolved(value.clone()),
                    ParamTemplate::Entity { key, default } => ParamValue::Resolved(
                        intent
                            .entity(key)
                            .map(|v| Value::String(v.to_string()))
                            .or_else(|| default.clone())
                            .unwrap_or(Value::Null),
                    ),
                    ParamTemplate::FromResult {
                        category,
                        pointer,
                        reduce,
                    } => ParamValue::Deferred(ResultRef {
                        category: category.clone(),
                        pointer: pointer.clone(),
                        reduce: *reduce,
                    }),
                };
                (name.clone(), value)
            })
            .collect();

        TaskDescriptor {
            worker: template.worker.clone(),
            operation: template.operation.clone(),
            params,
            tier: template.tier.max(1),
            timeout: template
                .timeout_ms
                .map_or(self.default_timeout, Duration::from_millis),
            category: template.category.clone(),
            required: template.required,
        }
    }
}
