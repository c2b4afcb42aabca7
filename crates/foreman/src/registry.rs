//! Execution Registry (C6): authoritative, persisted store of every
//! [`TaskExecution`], with startup recovery reclassification (spec §4.1).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::error::RegistryError;
use crate::models::{ExecutionStatus, TaskExecution, TaskExecutionSpec};
use crate::persistence::write_atomic;

/// What the scheduler should do with a recovered execution on startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Re-enqueue at `now`.
    EnqueueNow,
    /// Re-enqueue at the execution's `next_retry_at`.
    EnqueueAtRetryTime,
}

#[derive(Default)]
pub struct ListFilter {
    pub status: Option<ExecutionStatus>,
    pub task_id: Option<String>,
}

pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Durable map of `execution_id -> TaskExecution`.
pub struct ExecutionRegistry {
    executions: RwLock<HashMap<String, TaskExecution>>,
    dir: PathBuf,
    /// Set when a persistence write fails; the next successful write clears it.
    dirty: std::sync::atomic::AtomicBool,
}

impl ExecutionRegistry {
    /// Loads every persisted execution from `dir`, reclassifying non-terminal
    /// executions per spec §4.1. Returns the registry plus the list of
    /// `(execution_id, action)` pairs the scheduler should re-enqueue.
    pub fn load(dir: PathBuf) -> std::io::Result<(Self, Vec<(String, RecoveryAction)>)> {
        let mut executions = HashMap::new();
        let mut recoveries = Vec::new();

        if dir.exists() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let contents = std::fs::read_to_string(&path)?;
                let mut exec: TaskExecution = match serde_json::from_str(&contents) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(?path, error = %e, "skipping unreadable execution record");
                        continue;
                    }
                };

                match exec.status {
                    ExecutionStatus::Running | ExecutionStatus::Preparing => {
                        exec.apply_transition(
                            ExecutionStatus::Pending,
                            Some(serde_json::json!({"reason": "recovered_after_restart"})),
                        );
                        recoveries.push((exec.execution_id.clone(), RecoveryAction::EnqueueNow));
                    }
                    ExecutionStatus::Retrying => {
                        recoveries.push((exec.execution_id.clone(), RecoveryAction::EnqueueAtRetryTime));
                    }
                    s if !s.is_terminal() => {
                        recoveries.push((exec.execution_id.clone(), RecoveryAction::EnqueueNow));
                    }
                    _ => {}
                }

                executions.insert(exec.execution_id.clone(), exec);
            }
        }

        debug!(count = executions.len(), recoveries = recoveries.len(), "loaded execution registry");

        Ok((
            ExecutionRegistry {
                executions: RwLock::new(executions),
                dir,
                dirty: std::sync::atomic::AtomicBool::new(false),
            },
            recoveries,
        ))
    }

    fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{execution_id}.json"))
    }

    /// Persists one record; on failure, logs and marks the registry dirty
    /// rather than failing the caller (spec §4.1 failure semantics).
    fn persist(&self, exec: &TaskExecution) {
        if let Err(e) = write_atomic(&self.path_for(&exec.execution_id), exec) {
            warn!(execution_id = %exec.execution_id, error = %e, "failed to persist execution");
            self.dirty.store(true, std::sync::atomic::Ordering::SeqCst);
        } else {
            self.dirty.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Allocates a new execution, validating that every dependency already
    /// exists (spec §3 invariant 6).
    pub fn create(&self, spec: TaskExecutionSpec) -> Result<TaskExecution, RegistryError> {
        {
            let executions = self.executions.read().unwrap();
            for dep in &spec.dependencies {
                if !executions.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency(dep.clone()));
                }
            }
        }

        let exec = TaskExecution::new(spec);
        self.persist(&exec);
        self.executions
            .write()
            .unwrap()
            .insert(exec.execution_id.clone(), exec.clone());
        Ok(exec)
    }

    pub fn get(&self, execution_id: &str) -> Result<TaskExecution, RegistryError> {
        self.executions
            .read()
            .unwrap()
            .get(execution_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(execution_id.to_string()))
    }

    pub fn exists(&self, execution_id: &str) -> bool {
        self.executions.read().unwrap().contains_key(execution_id)
    }

    /// Appends a transition and persists atomically.
    pub fn transition(
        &self,
        execution_id: &str,
        new_status: ExecutionStatus,
        details: Option<serde_json::Value>,
    ) -> Result<TaskExecution, RegistryError> {
        let mut executions = self.executions.write().unwrap();
        let exec = executions
            .get_mut(execution_id)
            .ok_or_else(|| RegistryError::NotFound(execution_id.to_string()))?;

        if exec.status.is_terminal() {
            return Err(RegistryError::InvalidTransition {
                execution_id: execution_id.to_string(),
                from: format!("{:?}", exec.status),
                to: format!("{new_status:?}"),
            });
        }

        exec.apply_transition(new_status, details);
        let snapshot = exec.clone();
        drop(executions);
        self.persist(&snapshot);
        Ok(snapshot)
    }

    /// Replaces the full record (used by the Retry Controller, which sets
    /// several fields — `retry_count`, `next_retry_at` — alongside a
    /// transition).
    pub fn save(&self, exec: TaskExecution) {
        self.persist(&exec);
        self.executions.write().unwrap().insert(exec.execution_id.clone(), exec);
    }

    pub fn list(&self, filter: ListFilter, limit: usize, offset: usize) -> Page<TaskExecution> {
        let executions = self.executions.read().unwrap();
        let mut matched: Vec<TaskExecution> = executions
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| filter.task_id.as_deref().is_none_or(|t| e.task_id == t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = matched.len();
        let page = matched.into_iter().skip(offset).take(limit).collect();
        Page { items: page, total, limit, offset }
    }

    pub fn all_ids(&self) -> Vec<String> {
        self.executions.read().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(task_id: &str) -> TaskExecutionSpec {
        TaskExecutionSpec {
            task_id: task_id.into(),
            workflow_type: "generic".into(),
            timeout_seconds: 60,
            max_retries: 3,
            ..Default::default()
        }
    }

    #[test]
    fn create_rejects_unknown_dependency() {
        let dir = tempdir().unwrap();
        let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        let mut s = spec("t1");
        s.dependencies = vec!["missing".into()];
        assert!(matches!(registry.create(s), Err(RegistryError::UnknownDependency(_))));
    }

    #[test]
    fn create_persists_and_reloads() {
        let dir = tempdir().unwrap();
        let exec_id = {
            let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
            registry.create(spec("t1")).unwrap().execution_id
        };

        let (registry, recoveries) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        assert!(registry.exists(&exec_id));
        // PENDING is non-terminal and gets recovered too.
        assert_eq!(recoveries.len(), 1);
    }

    #[test]
    fn running_is_reclassified_pending_on_recovery() {
        let dir = tempdir().unwrap();
        let exec_id = {
            let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
            let exec = registry.create(spec("t1")).unwrap();
            registry.transition(&exec.execution_id, ExecutionStatus::Preparing, None).unwrap();
            registry.transition(&exec.execution_id, ExecutionStatus::Running, None).unwrap().execution_id
        };

        let (registry, recoveries) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        let exec = registry.get(&exec_id).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(recoveries[0].1, RecoveryAction::EnqueueNow);
    }

    #[test]
    fn retrying_recovers_at_retry_time() {
        let dir = tempdir().unwrap();
        let exec_id = {
            let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
            let exec = registry.create(spec("t1")).unwrap();
            registry.transition(&exec.execution_id, ExecutionStatus::Retrying, None).unwrap().execution_id
        };

        let (_registry, recoveries) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        let (_, action) = recoveries.iter().find(|(id, _)| id == &exec_id).unwrap();
        assert_eq!(*action, RecoveryAction::EnqueueAtRetryTime);
    }

    #[test]
    fn terminal_execution_cannot_transition_again() {
        let dir = tempdir().unwrap();
        let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        let exec = registry.create(spec("t1")).unwrap();
        registry.transition(&exec.execution_id, ExecutionStatus::Preparing, None).unwrap();
        registry.transition(&exec.execution_id, ExecutionStatus::Running, None).unwrap();
        registry.transition(&exec.execution_id, ExecutionStatus::Completed, None).unwrap();
        assert!(registry
            .transition(&exec.execution_id, ExecutionStatus::Running, None)
            .is_err());
    }

    #[test]
    fn list_filters_by_status_and_paginates() {
        let dir = tempdir().unwrap();
        let (registry, _) = ExecutionRegistry::load(dir.path().to_path_buf()).unwrap();
        for i in 0..5 {
            registry.create(spec(&format!("t{i}"))).unwrap();
        }
        let page = registry.list(ListFilter { status: Some(ExecutionStatus::Pending), task_id: None }, 2, 0);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 5);
    }
}
