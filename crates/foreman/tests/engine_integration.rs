//! End-to-end scenarios driving a full `Engine` against in-memory fakes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use foreman::engine::ScheduleTaskRequest;
use foreman::models::{ExecutionStatus, Priority, RetryStrategy};
use foreman::pipeline_converter::InMemoryTemplateRegistry;
use foreman::ports::fakes::{InMemoryTaskStore, NoopNotifier};
use foreman::ports::{CancelHandle, PipelineRunner, RawResult, TaskSnapshot, TaskStore};
use foreman::registry::ListFilter;
use foreman::{Engine, EngineConfig};

// `Pipeline` lives in `foreman::models`, but the runner trait only needs its
// shape through `&Pipeline`; re-export path kept local to this file tidy.
type PipelineDoc = foreman::models::Pipeline;

struct AlwaysFailRunner;

#[async_trait]
impl PipelineRunner for AlwaysFailRunner {
    async fn execute(&self, _pipeline: &PipelineDoc, _cancel: CancelHandle) -> RawResult {
        RawResult { success: false, payload: json!({"success": false}), error: Some("boom".to_string()) }
    }
}

struct HangingRunner;

#[async_trait]
impl PipelineRunner for HangingRunner {
    async fn execute(&self, _pipeline: &PipelineDoc, _cancel: CancelHandle) -> RawResult {
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
        RawResult { success: true, payload: json!({"success": true}), error: None }
    }
}

struct RecordingRunner {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl PipelineRunner for RecordingRunner {
    async fn execute(&self, pipeline: &PipelineDoc, _cancel: CancelHandle) -> RawResult {
        self.order.lock().unwrap().push(pipeline.task_id.clone());
        RawResult { success: true, payload: json!({"success": true}), error: None }
    }
}

fn insert_task(store: &InMemoryTaskStore, task_id: &str) {
    store.insert(TaskSnapshot {
        task_id: task_id.to_string(),
        name: task_id.to_string(),
        description: None,
        status: "PENDING".to_string(),
        pipeline_parameters: HashMap::new(),
    });
}

fn build_engine(
    dir: &std::path::Path,
    runner: Arc<dyn PipelineRunner>,
    task_ids: &[&str],
    max_concurrent: usize,
) -> Arc<Engine> {
    let config = EngineConfig::builder()
        .data_dir(dir)
        .max_concurrent_executions(max_concurrent)
        .scheduler_interval(StdDuration::from_millis(20))
        .build();
    let task_store = Arc::new(InMemoryTaskStore::new());
    for id in task_ids {
        insert_task(&task_store, id);
    }
    let task_store: Arc<dyn TaskStore> = task_store;
    let notifier: Arc<dyn foreman::ports::Notifier> = Arc::new(NoopNotifier);
    let templates: Arc<dyn foreman::pipeline_converter::TemplateRegistry> = Arc::new(InMemoryTemplateRegistry::new());
    Engine::new(config, task_store, runner, Some(notifier), templates).unwrap()
}

async fn wait_until<F: Fn() -> bool>(check: F, timeout: StdDuration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(StdDuration::from_millis(15)).await;
    }
}

#[tokio::test]
async fn linear_chain_all_succeed() {
    let dir = tempfile::tempdir().unwrap();
    let runner: Arc<dyn PipelineRunner> = Arc::new(RecordingRunner { order: Arc::new(Mutex::new(Vec::new())) });
    let engine = build_engine(dir.path(), runner, &["a", "b", "c"], 4);
    engine.run();

    let graph = HashMap::from([
        ("a".to_string(), vec![]),
        ("b".to_string(), vec!["a".to_string()]),
        ("c".to_string(), vec!["a".to_string(), "b".to_string()]),
    ]);
    let result = engine
        .schedule_task_graph(graph, ScheduleTaskRequest::default(), HashMap::new())
        .await
        .unwrap();
    assert_eq!(result.task_order, vec!["a", "b", "c"]);

    let all_completed = wait_until(
        || {
            result
                .executions
                .iter()
                .all(|e| matches!(exec_status(&engine, &e.execution_id), Some(ExecutionStatus::Completed)))
        },
        StdDuration::from_secs(5),
    )
    .await;
    assert!(all_completed, "expected every execution in the chain to complete");

    engine.shutdown().await;
}

fn exec_status(engine: &Arc<Engine>, execution_id: &str) -> Option<ExecutionStatus> {
    engine
        .list_executions(ListFilter::default(), usize::MAX, 0)
        .items
        .into_iter()
        .find(|e| e.execution_id == execution_id)
        .map(|e| e.status)
}

#[tokio::test]
async fn retry_with_fixed_delay_exhausts_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let runner: Arc<dyn PipelineRunner> = Arc::new(AlwaysFailRunner);
    let engine = build_engine(dir.path(), runner, &["t1"], 2);
    engine.run();

    let scheduled = engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "t1".into(),
            retry_strategy: Some(RetryStrategy::FixedDelay),
            max_retries: Some(2),
            retry_delay_seconds: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();

    let failed = wait_until(
        || matches!(exec_status(&engine, &scheduled.execution_id), Some(ExecutionStatus::Failed)),
        StdDuration::from_secs(5),
    )
    .await;
    assert!(failed, "expected execution to land in FAILED once retries are exhausted");

    let view = engine.get_execution(&scheduled.execution_id).await.unwrap();
    assert_eq!(view.execution.retry_count, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn dependency_failure_cascades_to_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let runner: Arc<dyn PipelineRunner> = Arc::new(AlwaysFailRunner);
    let engine = build_engine(dir.path(), runner, &["a", "b"], 4);
    engine.run();

    let a = engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "a".into(),
            retry_strategy: Some(RetryStrategy::None),
            ..Default::default()
        })
        .await
        .unwrap();
    let b = engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "b".into(),
            dependencies: Some(vec![a.execution_id.clone()]),
            ..Default::default()
        })
        .await
        .unwrap();

    let both_failed = wait_until(
        || {
            matches!(exec_status(&engine, &a.execution_id), Some(ExecutionStatus::Failed))
                && matches!(exec_status(&engine, &b.execution_id), Some(ExecutionStatus::Failed))
        },
        StdDuration::from_secs(5),
    )
    .await;
    assert!(both_failed, "expected the dependent to be cascade-failed once its dependency failed");

    engine.shutdown().await;
}

#[tokio::test]
async fn timed_out_execution_is_aborted_and_marked() {
    let dir = tempfile::tempdir().unwrap();
    let runner: Arc<dyn PipelineRunner> = Arc::new(HangingRunner);
    let engine = build_engine(dir.path(), runner, &["t1"], 2);
    engine.run();

    let scheduled = engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "t1".into(),
            timeout_seconds: Some(0),
            retry_strategy: Some(RetryStrategy::None),
            ..Default::default()
        })
        .await
        .unwrap();

    let reached_terminal = wait_until(
        || {
            exec_status(&engine, &scheduled.execution_id)
                .map(|s| s.is_terminal())
                .unwrap_or(false)
        },
        StdDuration::from_secs(5),
    )
    .await;
    assert!(reached_terminal, "expected a hung execution to be force-timed-out");

    let view = engine.get_execution(&scheduled.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Failed);

    engine.shutdown().await;
}

#[tokio::test]
async fn cancel_before_dispatch_marks_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let runner: Arc<dyn PipelineRunner> = Arc::new(RecordingRunner { order: Arc::new(Mutex::new(Vec::new())) });
    let engine = build_engine(dir.path(), runner, &["t1"], 2);
    // No `run()` call: nothing dispatches the scheduler loop, so the
    // execution stays queued until we cancel it directly.

    let scheduled = engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "t1".into(),
            scheduled_time: Some(Utc::now() + chrono::Duration::seconds(60)),
            ..Default::default()
        })
        .await
        .unwrap();

    let outcome = engine.cancel_execution(&scheduled.execution_id).await.unwrap();
    assert!(outcome.success);

    let view = engine.get_execution(&scheduled.execution_id).await.unwrap();
    assert_eq!(view.execution.status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn higher_priority_executions_dispatch_first() {
    let dir = tempfile::tempdir().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let runner: Arc<dyn PipelineRunner> = Arc::new(RecordingRunner { order: order.clone() });
    let engine = build_engine(dir.path(), runner, &["low", "high", "critical"], 1);

    // Queue all three before the scheduler loop ever ticks, so they compete
    // in the ready heap purely on priority.
    engine
        .schedule_task(ScheduleTaskRequest { task_id: "low".into(), priority: Some(Priority::Low), ..Default::default() })
        .await
        .unwrap();
    engine
        .schedule_task(ScheduleTaskRequest { task_id: "high".into(), priority: Some(Priority::High), ..Default::default() })
        .await
        .unwrap();
    engine
        .schedule_task(ScheduleTaskRequest {
            task_id: "critical".into(),
            priority: Some(Priority::Critical),
            ..Default::default()
        })
        .await
        .unwrap();

    engine.run();
    let drained = wait_until(|| order.lock().unwrap().len() == 3, StdDuration::from_secs(5)).await;
    assert!(drained, "expected all three executions to run");

    let seen = order.lock().unwrap().clone();
    assert_eq!(seen, vec!["critical".to_string(), "high".to_string(), "low".to_string()]);

    engine.shutdown().await;
}
