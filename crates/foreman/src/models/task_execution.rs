use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Relative scheduling priority. Higher variants preempt lower ones in the
/// ready heap (see `scheduler::ReadyEntry`'s `Ord` implementation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low = 0,
    Medium = 1,
    High = 2,
    Critical = 3,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Backoff family applied by the Retry Controller (see `crate::retry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    None,
    Immediate,
    FixedDelay,
    ExponentialBackoff,
    FibonacciBackoff,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff
    }
}

/// Lifecycle state of a [`TaskExecution`]. String-valued on the wire (spec §9)
/// but a closed sum type in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Scheduled,
    Preparing,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    Timeout,
}

impl ExecutionStatus {
    /// Terminal states never transition except via explicit purge.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// One append-only entry in an execution's audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: ExecutionStatus,
    pub previous_status: Option<ExecutionStatus>,
    pub timestamp: DateTime<Utc>,
    pub details: Option<Value>,
}

/// Caller-supplied parameters for creating a new [`TaskExecution`] (the
/// request shape behind `ScheduleTask`).
#[derive(Debug, Clone, Default)]
pub struct TaskExecutionSpec {
    pub task_id: String,
    pub workflow_type: String,
    pub priority: Priority,
    pub workflow_params: HashMap<String, Value>,
    pub retry_strategy: RetryStrategy,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub timeout_seconds: u64,
    pub dependencies: Vec<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, Value>,
}

/// The central entity: one attempt (including retries) to run a task through
/// a pipeline. See spec §3 for the full invariant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub execution_id: String,
    pub task_id: String,
    pub workflow_id: Option<String>,
    pub container_id: Option<String>,

    pub priority: Priority,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub workflow_type: String,
    pub workflow_params: HashMap<String, Value>,
    pub timeout_seconds: u64,

    pub retry_strategy: RetryStrategy,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub retry_count: u32,

    pub dependencies: Vec<String>,

    pub result: Option<Value>,
    pub error: Option<String>,

    pub status: ExecutionStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status_history: Vec<StatusHistoryEntry>,

    pub metadata: HashMap<String, Value>,
}

impl TaskExecution {
    /// Allocates a new execution in PENDING (or SCHEDULED, if `scheduled_time`
    /// is in the future), seeding `status_history` with its first entry.
    pub fn new(spec: TaskExecutionSpec) -> Self {
        let now = Utc::now();
        let status = if spec.scheduled_time.is_some_and(|t| t > now) {
            ExecutionStatus::Scheduled
        } else {
            ExecutionStatus::Pending
        };

        let history = vec![StatusHistoryEntry {
            status,
            previous_status: None,
            timestamp: now,
            details: None,
        }];

        TaskExecution {
            execution_id: Uuid::new_v4().to_string(),
            task_id: spec.task_id,
            workflow_id: None,
            container_id: None,
            priority: spec.priority,
            scheduled_at: spec.scheduled_time,
            next_retry_at: None,
            workflow_type: spec.workflow_type,
            workflow_params: spec.workflow_params,
            timeout_seconds: spec.timeout_seconds,
            retry_strategy: spec.retry_strategy,
            max_retries: spec.max_retries,
            retry_delay_seconds: spec.retry_delay_seconds,
            retry_count: 0,
            dependencies: spec.dependencies,
            result: None,
            error: None,
            status,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            status_history: history,
            metadata: spec.metadata,
        }
    }

    /// Appends a transition, maintaining invariants §3.1-§3.3.
    pub fn apply_transition(&mut self, new_status: ExecutionStatus, details: Option<Value>) {
        let now = Utc::now();
        let previous = self.status;

        self.status_history.push(StatusHistoryEntry {
            status: new_status,
            previous_status: Some(previous),
            timestamp: now,
            details,
        });

        self.status = new_status;
        self.updated_at = now;

        if new_status == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if new_status.is_terminal() {
            self.completed_at = Some(now);
        }
    }

    /// `can_execute`: eligible to occupy a worker slot (not terminal, not cancelled).
    pub fn can_execute(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// The time at which this execution becomes eligible for dispatch
    /// (spec §4.2: `scheduled_at` for SCHEDULED, `next_retry_at` for
    /// RETRYING, otherwise "now").
    pub fn ready_time(&self) -> DateTime<Utc> {
        match self.status {
            ExecutionStatus::Scheduled => self.scheduled_at.unwrap_or(self.created_at),
            ExecutionStatus::Retrying => self.next_retry_at.unwrap_or(self.updated_at),
            _ => self.created_at,
        }
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => {
                let elapsed = now.signed_duration_since(started);
                elapsed.num_seconds() as u64 > self.timeout_seconds
            }
            None => false,
        }
    }
}
