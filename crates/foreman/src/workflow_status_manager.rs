//! Workflow Status Manager (C4): orchestration around [`WorkflowStatus`],
//! with single-file persistence and status-change broadcasts (spec §4.7).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde_json::Value;
use tracing::warn;

use crate::error::StatusError;
use crate::models::{WorkflowState, WorkflowStatus};
use crate::persistence::write_atomic;
use crate::ports::Notifier;

pub struct WorkflowStatusManager {
    statuses: RwLock<HashMap<String, WorkflowStatus>>,
    path: PathBuf,
    notifier: Option<std::sync::Arc<dyn Notifier>>,
}

impl WorkflowStatusManager {
    pub fn new(path: impl Into<PathBuf>, notifier: Option<std::sync::Arc<dyn Notifier>>) -> Self {
        WorkflowStatusManager { statuses: RwLock::new(HashMap::new()), path: path.into(), notifier }
    }

    /// Loads the single status file, if present, tolerating a missing or
    /// corrupt file by starting empty (recovered executions re-create their
    /// workflow status on first transition).
    pub fn load(path: impl Into<PathBuf>, notifier: Option<std::sync::Arc<dyn Notifier>>) -> Self {
        let path = path.into();
        let statuses = std::fs::read_to_string(&path)
            .ok()
            .and_then(|s| serde_json::from_str::<HashMap<String, WorkflowStatus>>(&s).ok())
            .unwrap_or_default();
        WorkflowStatusManager { statuses: RwLock::new(statuses), path, notifier }
    }

    fn persist(&self, statuses: &HashMap<String, WorkflowStatus>) {
        if let Err(e) = write_atomic(&self.path, statuses) {
            warn!(error = %e, "failed to persist workflow statuses");
        }
    }

    async fn notify(&self, topic: &str, message: Value) {
        if let Some(notifier) = &self.notifier {
            notifier.publish(topic, message).await;
        }
    }

    /// `Create`: seeds a new `WorkflowStatus` at `initial_state`.
    pub async fn create(&self, workflow_id: &str, initial_state: WorkflowState, metadata: HashMap<String, Value>) -> WorkflowStatus {
        let status = WorkflowStatus::new(workflow_id, initial_state, metadata);
        {
            let mut statuses = self.statuses.write().unwrap();
            statuses.insert(workflow_id.to_string(), status.clone());
            self.persist(&statuses);
        }
        self.notify("workflow.created", serde_json::json!({"workflow_id": workflow_id, "state": initial_state})).await;
        status
    }

    /// `UpdateState`: appends a transition and broadcasts the change.
    pub async fn update_state(&self, workflow_id: &str, new_state: WorkflowState, details: Value) -> Result<WorkflowStatus, StatusError> {
        let updated = {
            let mut statuses = self.statuses.write().unwrap();
            let status = statuses
                .get_mut(workflow_id)
                .ok_or_else(|| StatusError::NotFound(workflow_id.to_string()))?;
            status.update_state(new_state, details);
            let updated = status.clone();
            self.persist(&statuses);
            updated
        };
        self.notify(
            "workflow.state_changed",
            serde_json::json!({"workflow_id": workflow_id, "state": new_state}),
        )
        .await;
        Ok(updated)
    }

    pub fn update_metadata(&self, workflow_id: &str, patch: HashMap<String, Value>) -> Result<(), StatusError> {
        let mut statuses = self.statuses.write().unwrap();
        let status = statuses
            .get_mut(workflow_id)
            .ok_or_else(|| StatusError::NotFound(workflow_id.to_string()))?;
        status.update_metadata(patch);
        self.persist(&statuses);
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> Option<WorkflowStatus> {
        self.statuses.read().unwrap().get(workflow_id).cloned()
    }

    pub fn get_active(&self) -> Vec<WorkflowStatus> {
        self.statuses.read().unwrap().values().filter(|s| s.is_active()).cloned().collect()
    }

    pub fn get_completed(&self) -> Vec<WorkflowStatus> {
        self.statuses.read().unwrap().values().filter(|s| s.is_completed()).cloned().collect()
    }

    pub fn get_failed(&self) -> Vec<WorkflowStatus> {
        self.statuses.read().unwrap().values().filter(|s| s.is_failed()).cloned().collect()
    }

    pub fn get_by_state(&self, state: WorkflowState) -> Vec<WorkflowStatus> {
        self.statuses.read().unwrap().values().filter(|s| s.current_state == state).cloned().collect()
    }

    pub fn get_by_metadata(&self, key: &str, value: &Value) -> Vec<WorkflowStatus> {
        self.statuses
            .read()
            .unwrap()
            .values()
            .filter(|s| s.metadata.get(key) == Some(value))
            .cloned()
            .collect()
    }

    pub fn get_count(&self) -> usize {
        self.statuses.read().unwrap().len()
    }

    /// `ClearCompleted`: drops terminal (completed/failed/cancelled) statuses
    /// whose `updated_at` is older than `older_than_days`, or every terminal
    /// status if `None`. Returns the number removed.
    pub fn clear_completed(&self, older_than_days: Option<u32>) -> usize {
        let cutoff = older_than_days.map(|days| chrono::Utc::now() - chrono::Duration::days(days as i64));
        let mut statuses = self.statuses.write().unwrap();
        let before = statuses.len();
        statuses.retain(|_, s| s.is_active() || cutoff.is_some_and(|cutoff| s.updated_at > cutoff));
        self.persist(&statuses);
        before - statuses.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update_state_appends_history() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStatusManager::new(dir.path().join("statuses.json"), None);
        manager.create("wf1", WorkflowState::Created, HashMap::new()).await;
        manager.update_state("wf1", WorkflowState::Running, serde_json::json!({})).await.unwrap();
        let status = manager.get("wf1").unwrap();
        assert_eq!(status.current_state, WorkflowState::Running);
        assert_eq!(status.history.len(), 2);
    }

    #[tokio::test]
    async fn update_state_on_unknown_workflow_errors() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStatusManager::new(dir.path().join("statuses.json"), None);
        let err = manager.update_state("missing", WorkflowState::Running, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, StatusError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_active_completed_failed_partition_correctly() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStatusManager::new(dir.path().join("statuses.json"), None);
        manager.create("wf1", WorkflowState::Running, HashMap::new()).await;
        manager.create("wf2", WorkflowState::Completed, HashMap::new()).await;
        assert_eq!(manager.get_active().len(), 1);
        assert_eq!(manager.get_completed().len(), 1);
    }

    #[tokio::test]
    async fn clear_completed_removes_only_terminal_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStatusManager::new(dir.path().join("statuses.json"), None);
        manager.create("wf1", WorkflowState::Running, HashMap::new()).await;
        manager.create("wf2", WorkflowState::Failed, HashMap::new()).await;
        assert_eq!(manager.clear_completed(None), 1);
        assert_eq!(manager.get_count(), 1);
    }

    #[tokio::test]
    async fn clear_completed_respects_age_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowStatusManager::new(dir.path().join("statuses.json"), None);
        manager.create("wf1", WorkflowState::Failed, HashMap::new()).await;
        {
            let mut statuses = manager.statuses.write().unwrap();
            let old = statuses.get_mut("wf1").unwrap();
            old.updated_at = chrono::Utc::now() - chrono::Duration::days(10);
        }
        manager.create("wf2", WorkflowState::Failed, HashMap::new()).await;

        assert_eq!(manager.clear_completed(Some(5)), 1);
        assert!(manager.get("wf1").is_none());
        assert!(manager.get("wf2").is_some());
    }

    #[tokio::test]
    async fn load_restores_persisted_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("statuses.json");
        {
            let manager = WorkflowStatusManager::new(&path, None);
            manager.create("wf1", WorkflowState::Created, HashMap::new()).await;
        }
        let reloaded = WorkflowStatusManager::load(&path, None);
        assert!(reloaded.get("wf1").is_some());
    }
}
