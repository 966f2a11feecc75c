//! Worker Registry
//!
//! Maps worker ids to live [`Worker`] handles. Each worker declares the
//! operations it supports, so a plan can be checked against the registry
//! before anything is dispatched.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use super::PlanError;
use crate::fault::Fault;

/// Named parameters passed to a worker operation
pub type Params = Map<String, Value>;

/// A specialized backend the executor can invoke
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    /// Operations accepted by [`invoke`](Self::invoke)
    fn operations(&self) -> &[&'static str];

    async fn invoke(&self, operation: &str, params: &Params, timeout: Duration)
    -> Result<Value, Fault>;
}

#[derive(Default)]
pub struct WorkerRegistry {
    workers: HashMap<String, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) -> Result<(), PlanError> {
        let id = worker.id().to_string();
        if self.workers.contains_key(&id) {
            return Err(PlanError::DuplicateWorker { worker: id });
        }

        info!(
            "registered worker {} ({})",
            id,
            worker.operations().join(", ")
        );
        self.workers.insert(id, worker);
        Ok(())
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_worker(mut self, worker: Arc<dyn Worker>) -> Result<Self, PlanError> {
        self.register(worker)?;
        Ok(self)
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(id).cloned()
    }

    /// Check that `worker` exists and supports `operation`.
    pub fn resolve(&self, worker: &str, operation: &str) -> Result<Arc<dyn Worker>, PlanError> {
        let handle = self
            .workers
            .get(worker)
            .ok_or_else(|| PlanError::UnknownWorker {
                worker: worker.to_string(),
            })?;

        if !handle.operations().contains(&operation) {
            return Err(PlanError::UnknownOperation {
                worker: worker.to_string(),
                operation: operation.to_string(),
            });
        }

        Ok(handle.clone())
    }

    /// Registered ids, sorted
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.workers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
