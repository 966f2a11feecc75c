//! Concurrent Executor
//!
//! Runs a [`TaskPlan`] tier by tier. Tasks inside a tier run concurrently,
//! bounded by a semaphore; the next tier starts only once every task of the
//! current tier has produced a result. Every task yields exactly one
//! [`TaskResult`], in plan order, whether it succeeded, failed, timed out,
//! was skipped by the circuit breaker, or was abandoned on cancellation.
//!
//! # Features
//!
//! - Semaphore-based concurrency control
//! - Per-task timeout and request-level cancellation
//! - Health tracker consulted before queueing, and updated after, each invocation
//! - Prior-tier results substituted into deferred parameters

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::planner::{TaskDescriptor, TaskPlan};
use super::registry::{Params, WorkerRegistry};
use crate::fault::{ErrorCategory, ErrorDetail, Fault, classify};
use crate::health::HealthTracker;
use crate::metrics::{CallOutcome, Metrics};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum invocations in flight for one request
    pub max_concurrency: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { max_concurrency: 3 }
    }
}

// ============================================================================
// Task Result
// ============================================================================

/// Outcome of one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub worker: String,
    pub operation: String,
    pub category: String,
    pub tier: u8,
    pub required: bool,
    pub success: bool,
    pub payload: Option<Value>,
    pub error: Option<ErrorDetail>,
    pub elapsed: Duration,

    #[serde(skip)]
    pub started_at: Option<Instant>,

    #[serde(skip)]
    pub finished_at: Option<Instant>,
}

impl TaskResult {
    fn finish(task: &TaskDescriptor, started: Instant) -> Self {
        let now = Instant::now();
        Self {
            worker: task.worker.clone(),
            operation: task.operation.clone(),
            category: task.category.clone(),
            tier: task.tier,
            required: task.required,
            success: false,
            payload: None,
            error: None,
            elapsed: now.saturating_duration_since(started),
            started_at: Some(started),
            finished_at: Some(now),
        }
    }

    fn succeeded(task: &TaskDescriptor, payload: Value, started: Instant) -> Self {
        Self {
            success: true,
            payload: Some(payload),
            ..Self::finish(task, started)
        }
    }

    fn failed(task: &TaskDescriptor, error: ErrorDetail, started: Instant) -> Self {
        Self {
            error: Some(error),
            ..Self::finish(task, started)
        }
    }

    fn abandoned(task: &TaskDescriptor, started: Instant) -> Self {
        Self::failed(
            task,
            ErrorDetail::new(
                ErrorCategory::Timeout,
                "abandoned: request deadline reached",
            ),
            started,
        )
    }

    #[cfg(test)]
    pub(crate) fn for_test(worker: &str, category: &str, payload: Option<Value>) -> Self {
        Self {
            worker: worker.to_string(),
            operation: "test".to_string(),
            category: category.to_string(),
            tier: 1,
            required: false,
            success: payload.is_some(),
            error: payload
                .is_none()
                .then(|| ErrorDetail::new(ErrorCategory::Internal, "failed")),
            payload,
            elapsed: Duration::ZERO,
            started_at: None,
            finished_at: None,
        }
    }
}

enum Outcome {
    Completed(Result<Value, Fault>),
    TimedOut,
    Abandoned,
}

// ============================================================================
// Executor
// ============================================================================

pub struct ConcurrentExecutor {
    registry: Arc<WorkerRegistry>,
    health: Arc<HealthTracker>,
    metrics: Option<Arc<Metrics>>,
    max_concurrency: usize,
}

impl ConcurrentExecutor {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        health: Arc<HealthTracker>,
        config: &ExecutorConfig,
    ) -> Self {
        for id in registry.ids() {
            health.register(&id);
        }

        Self {
            registry,
            health,
            metrics: None,
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run every tier of `plan`, returning one result per task in plan order.
    pub async fn execute(&self, plan: &TaskPlan, cancel: &CancellationToken) -> Vec<TaskResult> {
        let permits = Semaphore::new(self.max_concurrency);
        let mut results: Vec<TaskResult> = Vec::with_capacity(plan.task_count());

        for tier in &plan.tiers {
            if cancel.is_cancelled() {
                warn!(
                    "request cancelled, abandoning tier {} ({} tasks)",
                    tier.level,
                    tier.tasks.len()
                );
                let now = Instant::now();
                results.extend(tier.tasks.iter().map(|t| TaskResult::abandoned(t, now)));
                continue;
            }

            info!(
                "dispatching tier {} with {} tasks (max {} concurrent)",
                tier.level,
                tier.tasks.len(),
                self.max_concurrency
            );

            let params: Vec<Params> = tier
                .tasks
                .iter()
                .map(|task| task.resolve_params(&results))
                .collect();

            let tier_results = join_all(
                tier.tasks
                    .iter()
                    .zip(&params)
                    .map(|(task, params)| self.run_task(task, params, &permits, cancel)),
            )
            .await;

            debug!(
                "tier {} finished: {}/{} succeeded",
                tier.level,
                tier_results.iter().filter(|r| r.success).count(),
                tier_results.len()
            );
            results.extend(tier_results);
        }

        results
    }

    async fn run_task(
        &self,
        task: &TaskDescriptor,
        params: &Params,
        permits: &Semaphore,
        cancel: &CancellationToken,
    ) -> TaskResult {
        let queued = Instant::now();

        // Unregistered and circuit-open workers never wait for a permit.
        let Some(worker) = self.registry.get(&task.worker) else {
            self.record(task, CallOutcome::Skipped, None);
            return TaskResult::failed(
                task,
                ErrorDetail::new(
                    ErrorCategory::Internal,
                    format!("{} is not registered", task.worker),
                ),
                queued,
            );
        };

        if !self.health.is_available(&task.worker) {
            debug!("skipping {}.{}: circuit open", task.worker, task.operation);
            self.record(task, CallOutcome::Skipped, None);
            return TaskResult::failed(
                task,
                ErrorDetail::new(
                    ErrorCategory::UpstreamApi,
                    format!("{} is unavailable (circuit open)", task.worker),
                ),
                queued,
            );
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.record(task, CallOutcome::Abandoned, None);
                return TaskResult::abandoned(task, queued);
            }
            permit = permits.acquire() => permit,
        };
        let Ok(_permit) = permit else {
            return TaskResult::failed(
                task,
                ErrorDetail::new(ErrorCategory::Internal, "executor shut down"),
                queued,
            );
        };

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Abandoned,
            result = tokio::time::timeout(
                task.timeout,
                worker.invoke(&task.operation, params, task.timeout),
            ) => match result {
                Ok(completed) => Outcome::Completed(completed),
                Err(_) => Outcome::TimedOut,
            },
        };

        match outcome {
            Outcome::Completed(Ok(payload)) => {
                self.health.record_success(&task.worker);
                self.record(task, CallOutcome::Success, Some(started.elapsed()));
                debug!(
                    "{}.{} completed in {:?}",
                    task.worker,
                    task.operation,
                    started.elapsed()
                );
                TaskResult::succeeded(task, payload, started)
            }
            Outcome::Completed(Err(fault)) => {
                let class = classify(&fault);
                if class.recoverable {
                    self.health.record_error_as(&task.worker, class.category);
                }
                self.record(task, CallOutcome::Error, Some(started.elapsed()));
                warn!(
                    "{}.{} failed ({}): {}",
                    task.worker, task.operation, class.category, fault
                );
                TaskResult::failed(task, ErrorDetail::from_fault(&fault), started)
            }
            Outcome::TimedOut => {
                self.health
                    .record_error_as(&task.worker, ErrorCategory::Timeout);
                self.record(task, CallOutcome::Timeout, Some(started.elapsed()));
                warn!(
                    "{}.{} timed out after {:?}",
                    task.worker, task.operation, task.timeout
                );
                TaskResult::failed(
                    task,
                    ErrorDetail::new(
                        ErrorCategory::Timeout,
                        format!("{} timed out after {:?}", task.worker, task.timeout),
                    ),
                    started,
                )
            }
            Outcome::Abandoned => {
                debug!("{}.{} abandoned on cancellation", task.worker, task.operation);
                self.record(task, CallOutcome::Abandoned, None);
                TaskResult::abandoned(task, started)
            }
        }
    }

    fn record(&self, task: &TaskDescriptor, outcome: CallOutcome, elapsed: Option<Duration>) {
        if let Some(metrics) = &self.metrics {
            metrics.record_worker_call(&task.worker, &task.operation, outcome, elapsed);
        }
    }
}
