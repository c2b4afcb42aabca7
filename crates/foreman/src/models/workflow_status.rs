use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// High-level workflow state, distinct from (and coarser than) [`super::ExecutionStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Created,
    Preparing,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl WorkflowState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// One append-only entry in a workflow's state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub source: WorkflowState,
    pub target: WorkflowState,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

/// Tracks a single workflow's lifecycle with a full, append-only transition
/// history (spec §4.7 / C4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStatus {
    pub workflow_id: String,
    pub current_state: WorkflowState,
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StatusTransition>,
}

impl WorkflowStatus {
    /// Seeds the initial `UNKNOWN -> initial_state` transition, matching the
    /// source implementation's constructor behavior.
    pub fn new(workflow_id: impl Into<String>, initial_state: WorkflowState, metadata: HashMap<String, Value>) -> Self {
        let now = Utc::now();
        WorkflowStatus {
            workflow_id: workflow_id.into(),
            current_state: initial_state,
            metadata,
            created_at: now,
            updated_at: now,
            history: vec![StatusTransition {
                source: WorkflowState::Unknown,
                target: initial_state,
                timestamp: now,
                details: serde_json::json!({"action": "created"}),
            }],
        }
    }

    pub fn update_state(&mut self, new_state: WorkflowState, details: Value) {
        let now = Utc::now();
        self.history.push(StatusTransition {
            source: self.current_state,
            target: new_state,
            timestamp: now,
            details,
        });
        self.current_state = new_state;
        self.updated_at = now;
    }

    /// Shallow dict.update-style merge of `patch` into `metadata`.
    pub fn update_metadata(&mut self, patch: HashMap<String, Value>) {
        self.metadata.extend(patch);
        self.updated_at = Utc::now();
    }

    pub fn is_active(&self) -> bool {
        self.current_state.is_active()
    }

    pub fn is_completed(&self) -> bool {
        self.current_state == WorkflowState::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.current_state == WorkflowState::Failed
    }

    /// Time spent in the most recent contiguous run of `state`, or `None` if
    /// `state` was never entered.
    pub fn get_state_duration(&self, state: WorkflowState) -> Option<Duration> {
        let entry = self.history.iter().rev().find(|t| t.target == state)?;
        let end = self
            .history
            .iter()
            .rev()
            .find(|t| t.timestamp > entry.timestamp && t.source == state)
            .map(|t| t.timestamp)
            .unwrap_or(self.updated_at);
        (end - entry.timestamp).to_std().ok()
    }

    pub fn get_total_duration(&self) -> Duration {
        (self.updated_at - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_seeds_unknown_to_initial_transition() {
        let status = WorkflowStatus::new("wf-1", WorkflowState::Created, HashMap::new());
        assert_eq!(status.history.len(), 1);
        assert_eq!(status.history[0].source, WorkflowState::Unknown);
        assert_eq!(status.history[0].target, WorkflowState::Created);
        assert_eq!(status.current_state, WorkflowState::Created);
    }

    #[test]
    fn update_state_appends_and_advances_current() {
        let mut status = WorkflowStatus::new("wf-1", WorkflowState::Created, HashMap::new());
        status.update_state(WorkflowState::Running, serde_json::json!({}));
        assert_eq!(status.current_state, WorkflowState::Running);
        assert_eq!(status.history.len(), 2);
        assert_eq!(status.history.last().unwrap().source, WorkflowState::Created);
    }

    #[test]
    fn update_metadata_merges_shallow() {
        let mut status = WorkflowStatus::new("wf-1", WorkflowState::Created, HashMap::new());
        status.update_metadata(HashMap::from([("a".to_string(), serde_json::json!(1))]));
        status.update_metadata(HashMap::from([("b".to_string(), serde_json::json!(2))]));
        assert_eq!(status.metadata.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(status.metadata.get("b"), Some(&serde_json::json!(2)));
    }

    #[test]
    fn is_active_completed_failed_reflect_terminal_states() {
        let mut status = WorkflowStatus::new("wf-1", WorkflowState::Created, HashMap::new());
        assert!(status.is_active());
        status.update_state(WorkflowState::Completed, serde_json::json!({}));
        assert!(!status.is_active());
        assert!(status.is_completed());
        assert!(!status.is_failed());
    }
}
