//! Common test utilities for Scout tests
//!
//! Scripted in-memory workers, data sources and primary classifiers, plus a
//! helper that wires them into an orchestrator.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use scout::config::ScoutConfig;
use scout::fault::Fault;
use scout::health::HealthTracker;
use scout::intent::{PrimaryClassifier, PrimaryVerdict};
use scout::orchestration::{Orchestrator, Params, Worker};
use scout::router::{DataQuery, DataSource};

/// What a scripted collaborator does when called
#[derive(Clone)]
pub enum Behavior {
    Succeed(Value),
    /// Return the received parameters as an object
    Echo,
    Fail(fn() -> Fault),
    /// Never answer
    Hang,
}

pub fn connection_refused() -> Fault {
    Fault::Connection("connection refused".into())
}

async fn perform(behavior: Behavior, params: &Params) -> Result<Value, Fault> {
    match behavior {
        Behavior::Succeed(value) => Ok(value),
        Behavior::Echo => Ok(Value::Object(params.clone())),
        Behavior::Fail(fault) => Err(fault()),
        Behavior::Hang => {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
            Ok(Value::Null)
        }
    }
}

// ============================================================================
// Workers
// ============================================================================

pub struct ScriptedWorker {
    id: &'static str,
    ops: Vec<&'static str>,
    behavior: Mutex<Behavior>,
    calls: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(id: &'static str, ops: &[&'static str], behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id,
            ops: ops.to_vec(),
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn id(&self) -> &str {
        self.id
    }

    fn operations(&self) -> &[&'static str] {
        &self.ops
    }

    async fn invoke(
        &self,
        _operation: &str,
        params: &Params,
        _timeout: Duration,
    ) -> Result<Value, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior.lock().clone();
        perform(behavior, params).await
    }
}

// ============================================================================
// Data sources
// ============================================================================

pub struct ScriptedSource {
    id: String,
    priority: u32,
    behavior: Behavior,
    calls: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(id: impl Into<String>, priority: u32, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            priority,
            behavior,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataSource for ScriptedSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn priority(&self) -> u32 {
        self.priority
    }

    async fn fetch(&self, _query: &DataQuery, _timeout: Duration) -> Result<Value, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        perform(self.behavior.clone(), &Params::new()).await
    }
}

// ============================================================================
// Primary classifier
// ============================================================================

pub struct ScriptedPrimary {
    verdict: PrimaryVerdict,
    pub calls: AtomicUsize,
}

impl ScriptedPrimary {
    pub fn new(intent: &str, confidence: f32) -> Arc<Self> {
        Arc::new(Self {
            verdict: PrimaryVerdict {
                intent: intent.to_string(),
                confidence,
                entities: Default::default(),
            },
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PrimaryClassifier for ScriptedPrimary {
    async fn classify(&self, _text: &str, _timeout: Duration) -> Result<PrimaryVerdict, Fault> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

// ============================================================================
// Wiring
// ============================================================================

pub fn orchestrator(
    config: ScoutConfig,
    workers: &[Arc<ScriptedWorker>],
    primary: Option<Arc<ScriptedPrimary>>,
) -> (Orchestrator, Arc<HealthTracker>) {
    let health = Arc::new(HealthTracker::new(&config.health));
    let mut builder = Orchestrator::builder(config).health(health.clone());

    for worker in workers {
        builder = builder
            .worker(worker.clone())
            .expect("worker ids are unique");
    }
    if let Some(primary) = primary {
        builder = builder.primary(primary);
    }

    (builder.build().expect("metrics registry"), health)
}
