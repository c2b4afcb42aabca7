//! External collaborators the engine consumes but does not own (spec §6.2).
//!
//! These are trait objects (`Arc<dyn ...>`), not generic parameters: the
//! engine is assembled once at the composition root (see `crate::engine`)
//! against whichever concrete adapters a host provides.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TaskStoreError;
use crate::models::Pipeline;

/// A snapshot of the external task this engine is driving to completion.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub name: String,
    pub description: Option<String>,
    pub status: String,
    pub pipeline_parameters: HashMap<String, Value>,
}

/// Narrow interface onto the persistent Task store (projects/phases/tasks);
/// CRUD beyond this is explicitly out of scope (spec §1).
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task(&self, task_id: &str) -> Result<TaskSnapshot, TaskStoreError>;
    async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), TaskStoreError>;
    async fn update_task(&self, task_id: &str, patch: HashMap<String, Value>) -> Result<(), TaskStoreError>;
}

/// A handle a `PipelineRunner` uses to notice that its caller wants to abort.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The raw, unvalidated outcome of running a pipeline.
#[derive(Debug, Clone)]
pub struct RawResult {
    pub success: bool,
    pub payload: Value,
    pub error: Option<String>,
}

/// External container/workflow runtime (e.g. a Dagger-like engine). The
/// engine treats `workflow_type` as opaque and never branches on it (spec §9).
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn execute(&self, pipeline: &Pipeline, cancel: CancelHandle) -> RawResult;
}

/// Optional fan-out notification sink for status-change broadcasts (spec §4.7).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn publish(&self, topic: &str, message: Value);
}

#[cfg(any(test, feature = "test-utils"))]
pub mod fakes {
    use super::*;
    use std::sync::Mutex;

    pub struct InMemoryTaskStore {
        tasks: Mutex<HashMap<String, TaskSnapshot>>,
    }

    impl InMemoryTaskStore {
        pub fn new() -> Self {
            Self { tasks: Mutex::new(HashMap::new()) }
        }

        pub fn insert(&self, task: TaskSnapshot) {
            self.tasks.lock().unwrap().insert(task.task_id.clone(), task);
        }

        pub fn status_of(&self, task_id: &str) -> Option<String> {
            self.tasks.lock().unwrap().get(task_id).map(|t| t.status.clone())
        }
    }

    #[async_trait]
    impl TaskStore for InMemoryTaskStore {
        async fn get_task(&self, task_id: &str) -> Result<TaskSnapshot, TaskStoreError> {
            self.tasks
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))
        }

        async fn update_task_status(&self, task_id: &str, status: &str) -> Result<(), TaskStoreError> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))?;
            task.status = status.to_string();
            Ok(())
        }

        async fn update_task(&self, task_id: &str, patch: HashMap<String, Value>) -> Result<(), TaskStoreError> {
            let mut tasks = self.tasks.lock().unwrap();
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| TaskStoreError::NotFound(task_id.to_string()))?;
            if let Some(status) = patch.get("status").and_then(|v| v.as_str()) {
                task.status = status.to_string();
            }
            Ok(())
        }
    }

    pub struct AlwaysSucceedRunner;

    #[async_trait]
    impl PipelineRunner for AlwaysSucceedRunner {
        async fn execute(&self, pipeline: &Pipeline, _cancel: CancelHandle) -> RawResult {
            RawResult {
                success: true,
                payload: serde_json::json!({"success": true, "container_id": pipeline.task_id}),
                error: None,
            }
        }
    }

    pub struct NoopNotifier;

    #[async_trait]
    impl Notifier for NoopNotifier {
        async fn publish(&self, _topic: &str, _message: Value) {}
    }
}
