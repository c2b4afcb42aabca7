//! The composition root (spec §6.1, §9): owns every component and runs the
//! scheduler loop / worker tasks against them. No global singleton — callers
//! construct one `Engine` (typically wrapped in an `Arc`) and pass it down.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::dependency_graph::DependencyGraph;
use crate::error::EngineError;
use crate::models::{
    ExecutionStatus, Priority, RetryStrategy, TaskExecution, TaskExecutionSpec, WorkflowState,
};
use crate::pipeline_converter::{PipelineConverter, TemplateRegistry};
use crate::ports::{CancelHandle, Notifier, PipelineRunner, TaskStore};
use crate::registry::{ExecutionRegistry, ListFilter, Page, RecoveryAction};
use crate::result_store::ResultStore;
use crate::retry;
use crate::scheduler::{RunningEntry, Scheduler};
use crate::workflow_cache::WorkflowCache;
use crate::workflow_status_manager::WorkflowStatusManager;

type Hook = Arc<dyn Fn(&TaskExecution) + Send + Sync>;

/// Input to `Engine::schedule_task`; every field beyond `task_id` falls back
/// to an `EngineConfig` default when omitted.
#[derive(Clone, Default)]
pub struct ScheduleTaskRequest {
    pub task_id: String,
    pub workflow_type: Option<String>,
    pub priority: Option<Priority>,
    pub workflow_params: Option<HashMap<String, Value>>,
    pub retry_strategy: Option<RetryStrategy>,
    pub max_retries: Option<u32>,
    pub retry_delay_seconds: Option<u64>,
    pub timeout_seconds: Option<u64>,
    pub dependencies: Option<Vec<String>>,
    pub scheduled_time: Option<chrono::DateTime<Utc>>,
    pub metadata: Option<HashMap<String, Value>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledExecution {
    pub execution_id: String,
    pub task_id: String,
    pub status: ExecutionStatus,
    pub scheduled_time: Option<chrono::DateTime<Utc>>,
    pub priority: Priority,
}

#[derive(Debug, Default)]
pub struct BatchResult {
    pub successful: Vec<ScheduledExecution>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct GraphResult {
    pub executions: Vec<ScheduledExecution>,
    pub task_order: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CancelOutcome {
    pub execution_id: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ExecutionView {
    pub execution: TaskExecution,
    pub task_status: Option<String>,
    pub workflow_state: Option<WorkflowState>,
}

#[derive(Debug, Default)]
pub struct ExecutionStats {
    pub total: usize,
    pub status_counts: HashMap<String, usize>,
    pub queue_length: usize,
    pub running_count: usize,
}

/// Owns every component (spec §4) and drives the scheduler loop / worker
/// tasks against them.
pub struct Engine {
    config: EngineConfig,
    registry: ExecutionRegistry,
    dependency_graph: DependencyGraph,
    scheduler: Scheduler,
    converter: PipelineConverter,
    cache: WorkflowCache,
    results: ResultStore,
    statuses: WorkflowStatusManager,
    task_store: Arc<dyn TaskStore>,
    pipeline_runner: Arc<dyn PipelineRunner>,
    pre_hooks: Mutex<Vec<Hook>>,
    post_hooks: Mutex<Vec<Hook>>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Loads persisted state (executions, cache, results, workflow statuses)
    /// from `config.data_dir()` and re-enqueues every recovered execution.
    pub fn new(
        config: EngineConfig,
        task_store: Arc<dyn TaskStore>,
        pipeline_runner: Arc<dyn PipelineRunner>,
        notifier: Option<Arc<dyn Notifier>>,
        templates: Arc<dyn TemplateRegistry>,
    ) -> Result<Arc<Engine>, EngineError> {
        let (registry, recoveries) = ExecutionRegistry::load(config.executions_dir())
            .map_err(|e| EngineError::Internal(format!("failed to load execution registry: {e}")))?;

        let dependency_graph = DependencyGraph::new();
        for id in registry.all_ids() {
            if let Ok(exec) = registry.get(&id) {
                dependency_graph.register(&exec.execution_id, &exec.dependencies);
            }
        }

        let scheduler = Scheduler::new(config.max_concurrent_executions());
        let now = Utc::now();
        for (execution_id, action) in &recoveries {
            if let Ok(exec) = registry.get(execution_id) {
                let ready_time = match action {
                    RecoveryAction::EnqueueNow => now,
                    RecoveryAction::EnqueueAtRetryTime => exec.next_retry_at.unwrap_or(now),
                };
                scheduler.enqueue(exec.execution_id.clone(), exec.priority, ready_time, now);
            }
        }
        info!(recovered = recoveries.len(), "execution registry recovered");

        let cache = WorkflowCache::load(config.cache_dir(), config.cache_ttl_seconds())
            .map_err(|e| EngineError::Internal(format!("failed to load workflow cache: {e}")))?;
        let results = ResultStore::new(config.results_dir(), config.result_cache_size());
        let statuses = WorkflowStatusManager::load(config.status_file(), notifier);
        let converter = PipelineConverter::new(templates);

        Ok(Arc::new(Engine {
            config,
            registry,
            dependency_graph,
            scheduler,
            converter,
            cache,
            results,
            statuses,
            task_store,
            pipeline_runner,
            pre_hooks: Mutex::new(Vec::new()),
            post_hooks: Mutex::new(Vec::new()),
            scheduler_handle: Mutex::new(None),
        }))
    }

    /// Spawns the scheduler loop; returns a handle the caller may await.
    pub fn run(self: &Arc<Self>) {
        let engine = self.clone();
        let handle = tokio::spawn(async move { scheduler_loop(engine).await });
        *self.scheduler_handle.lock().unwrap() = Some(handle);
    }

    /// Signals the scheduler loop to stop after its current tick. Running
    /// workers are not forcibly aborted; they drain on their own.
    pub async fn shutdown(self: &Arc<Self>) {
        self.scheduler.shutdown.store(true, std::sync::atomic::Ordering::SeqCst);
        self.scheduler.notify.notify_waiters();
        let handle = self.scheduler_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn add_pre_execution_hook<F: Fn(&TaskExecution) + Send + Sync + 'static>(&self, hook: F) {
        self.pre_hooks.lock().unwrap().push(Arc::new(hook));
    }

    pub fn add_post_execution_hook<F: Fn(&TaskExecution) + Send + Sync + 'static>(&self, hook: F) {
        self.post_hooks.lock().unwrap().push(Arc::new(hook));
    }

    fn build_spec(&self, req: ScheduleTaskRequest) -> TaskExecutionSpec {
        TaskExecutionSpec {
            task_id: req.task_id,
            workflow_type: req.workflow_type.unwrap_or_else(|| "generic".to_string()),
            priority: req.priority.unwrap_or_default(),
            workflow_params: req.workflow_params.unwrap_or_default(),
            retry_strategy: req.retry_strategy.unwrap_or_default(),
            max_retries: req.max_retries.unwrap_or_else(|| self.config.default_max_retries()),
            retry_delay_seconds: req
                .retry_delay_seconds
                .unwrap_or_else(|| self.config.default_retry_delay_seconds()),
            timeout_seconds: req.timeout_seconds.unwrap_or_else(|| self.config.default_timeout_seconds()),
            dependencies: req.dependencies.unwrap_or_default(),
            scheduled_time: req.scheduled_time,
            metadata: req.metadata.unwrap_or_default(),
        }
    }

    /// `ScheduleTask`.
    pub async fn schedule_task(&self, req: ScheduleTaskRequest) -> Result<ScheduledExecution, EngineError> {
        self.task_store.get_task(&req.task_id).await?;

        let spec = self.build_spec(req);
        for dep in &spec.dependencies {
            if !self.registry.exists(dep) {
                return Err(EngineError::InvalidParams(format!("unknown dependency: {dep}")));
            }
        }

        let exec = self.registry.create(spec)?;
        self.dependency_graph.register(&exec.execution_id, &exec.dependencies);
        self.scheduler.enqueue(exec.execution_id.clone(), exec.priority, exec.ready_time(), Utc::now());

        Ok(ScheduledExecution {
            execution_id: exec.execution_id,
            task_id: exec.task_id,
            status: exec.status,
            scheduled_time: exec.scheduled_at,
            priority: exec.priority,
        })
    }

    /// `ScheduleTaskBatch`.
    pub async fn schedule_task_batch(&self, task_ids: Vec<String>, opts: ScheduleTaskRequest) -> BatchResult {
        let mut result = BatchResult::default();
        for task_id in task_ids {
            let mut req = opts.clone();
            req.task_id = task_id.clone();
            match self.schedule_task(req).await {
                Ok(scheduled) => result.successful.push(scheduled),
                Err(e) => result.failed.push((task_id, e.to_string())),
            }
        }
        result
    }

    /// `ScheduleTaskGraph`: topologically schedules `task_graph` (task_id ->
    /// its dependency task_ids), wiring each execution's `dependencies` to
    /// the execution_ids its own dependency tasks were assigned.
    pub async fn schedule_task_graph(
        &self,
        task_graph: HashMap<String, Vec<String>>,
        opts: ScheduleTaskRequest,
        workflow_params: HashMap<String, HashMap<String, Value>>,
    ) -> Result<GraphResult, EngineError> {
        let order = topological_sort(&task_graph)?;

        let mut task_to_exec: HashMap<String, String> = HashMap::new();
        let mut executions = Vec::new();
        for task_id in &order {
            let dep_exec_ids: Vec<String> = task_graph
                .get(task_id)
                .into_iter()
                .flatten()
                .filter_map(|dep| task_to_exec.get(dep).cloned())
                .collect();

            let mut req = opts.clone();
            req.task_id = task_id.clone();
            req.dependencies = Some(dep_exec_ids);
            if let Some(params) = workflow_params.get(task_id) {
                req.workflow_params = Some(params.clone());
            }

            let scheduled = self.schedule_task(req).await?;
            task_to_exec.insert(task_id.clone(), scheduled.execution_id.clone());
            executions.push(scheduled);
        }

        Ok(GraphResult { executions, task_order: order })
    }

    /// `CancelExecution`.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<CancelOutcome, EngineError> {
        let exec = self.registry.get(execution_id)?;
        if exec.status.is_terminal() {
            return Ok(CancelOutcome {
                execution_id: execution_id.to_string(),
                success: false,
                message: "already_completed".to_string(),
            });
        }

        if let Some(cancel) = self.scheduler.cancel_handle_of(execution_id) {
            cancel.cancel();
            return Ok(CancelOutcome {
                execution_id: execution_id.to_string(),
                success: true,
                message: "cancel_signaled".to_string(),
            });
        }

        // Not yet dispatched: the ready/delay heaps don't support removal,
        // so mark it CANCELLED now; the dispatch loop discards it on pop
        // since `can_execute()` is false.
        self.registry.transition(
            execution_id,
            ExecutionStatus::Cancelled,
            Some(json!({"reason": "cancelled_before_dispatch"})),
        )?;
        let _ = self.task_store.update_task_status(&exec.task_id, "CANCELLED").await;
        cascade_dependents(self, execution_id, ExecutionStatus::Cancelled).await;

        Ok(CancelOutcome { execution_id: execution_id.to_string(), success: true, message: "cancelled".to_string() })
    }

    /// `GetExecution`.
    pub async fn get_execution(&self, execution_id: &str) -> Result<ExecutionView, EngineError> {
        let execution = self.registry.get(execution_id)?;
        let task_status = self.task_store.get_task(&execution.task_id).await.ok().map(|t| t.status);
        let workflow_state = execution
            .workflow_id
            .as_deref()
            .and_then(|id| self.statuses.get(id))
            .map(|s| s.current_state);
        Ok(ExecutionView { execution, task_status, workflow_state })
    }

    /// `ListExecutions`.
    pub fn list_executions(&self, filter: ListFilter, limit: usize, offset: usize) -> Page<TaskExecution> {
        self.registry.list(filter, limit, offset)
    }

    /// `GetExecutionStats`.
    pub fn get_execution_stats(&self) -> ExecutionStats {
        let all = self.registry.list(ListFilter::default(), usize::MAX, 0);
        let mut status_counts = HashMap::new();
        for exec in &all.items {
            *status_counts.entry(format!("{:?}", exec.status)).or_insert(0) += 1;
        }
        ExecutionStats {
            total: all.total,
            status_counts,
            queue_length: self.scheduler.ready_len(),
            running_count: self.scheduler.running_count(),
        }
    }
}

fn call_hooks(hooks: &Mutex<Vec<Hook>>, exec: &TaskExecution) {
    for hook in hooks.lock().unwrap().iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| hook(exec))).is_err() {
            warn!(execution_id = %exec.execution_id, "execution hook panicked");
        }
    }
}

fn schema_id_for(workflow_type: &str) -> &str {
    match workflow_type {
        "containerized_workflow" => "containerized_workflow",
        "dagger_pipeline" => "dagger_pipeline",
        _ => "generic",
    }
}

fn topological_sort(graph: &HashMap<String, Vec<String>>) -> Result<Vec<String>, EngineError> {
    let mut indegree: HashMap<&str, usize> = graph.keys().map(|k| (k.as_str(), 0)).collect();
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for (task, deps) in graph {
        for dep in deps {
            adjacency.entry(dep.as_str()).or_default().push(task.as_str());
            *indegree.entry(task.as_str()).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<&str> = indegree.iter().filter(|(_, &d)| d == 0).map(|(k, _)| *k).collect();
    ready.sort_unstable();
    let mut queue: VecDeque<&str> = ready.into();

    let mut order = Vec::new();
    while let Some(task) = queue.pop_front() {
        order.push(task.to_string());
        if let Some(dependents) = adjacency.get(task) {
            let mut newly_ready = Vec::new();
            for &dependent in dependents {
                let entry = indegree.get_mut(dependent).unwrap();
                *entry -= 1;
                if *entry == 0 {
                    newly_ready.push(dependent);
                }
            }
            newly_ready.sort_unstable();
            queue.extend(newly_ready);
        }
    }

    if order.len() != graph.len() {
        return Err(EngineError::CycleDetected);
    }
    Ok(order)
}

/// Outcome of checking whether an execution's dependencies allow dispatch.
enum Readiness {
    Ready,
    Waiting,
    BlockedBy(String),
}

fn check_dependencies(engine: &Engine, exec: &TaskExecution) -> Readiness {
    for dep_id in &exec.dependencies {
        let Ok(dep) = engine.registry.get(dep_id) else { continue };
        match dep.status {
            ExecutionStatus::Completed => continue,
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => return Readiness::BlockedBy(dep_id.clone()),
            _ => return Readiness::Waiting,
        }
    }
    Readiness::Ready
}

async fn dispatch_one(engine: &Arc<Engine>, execution_id: String, priority: Priority) {
    let Ok(exec) = engine.registry.get(&execution_id) else { return };
    if !exec.can_execute() {
        return;
    }

    match check_dependencies(engine, &exec) {
        Readiness::Ready => {}
        Readiness::Waiting => {
            let interval_secs = engine.config.scheduler_interval().as_secs() as i64;
            let retry_at = Utc::now() + chrono::Duration::seconds(interval_secs.max(1));
            engine.scheduler.push_delayed(execution_id, priority, retry_at);
            return;
        }
        Readiness::BlockedBy(dep_id) => {
            if engine
                .registry
                .transition(
                    &execution_id,
                    ExecutionStatus::Failed,
                    Some(json!({"reason": "dependency_failed", "source": dep_id})),
                )
                .is_ok()
            {
                let _ = engine.task_store.update_task_status(&exec.task_id, "FAILED").await;
                cascade_dependents(engine, &execution_id, ExecutionStatus::Failed).await;
            }
            return;
        }
    }

    let Some(slot) = crate::executor::SlotToken::try_acquire(engine.scheduler.semaphore.clone()) else {
        engine.scheduler.push_ready(execution_id, priority);
        return;
    };

    let cancel = CancelHandle::new();
    let started_at = Utc::now();
    let timeout_seconds = exec.timeout_seconds;
    let running_entry_cancel = cancel.clone();
    let engine_clone = engine.clone();
    let exec_id_for_worker = execution_id.clone();

    let join_handle = tokio::spawn(async move {
        run_worker(engine_clone, exec_id_for_worker, slot, cancel).await;
    });

    engine
        .scheduler
        .insert_running(execution_id, RunningEntry { join_handle, cancel: running_entry_cancel, started_at, timeout_seconds });
}

async fn run_worker(engine: Arc<Engine>, execution_id: String, _slot: crate::executor::SlotToken, cancel: CancelHandle) {
    if let Err(e) = engine.registry.transition(&execution_id, ExecutionStatus::Preparing, None) {
        warn!(execution_id = %execution_id, error = %e, "failed to transition to PREPARING");
        finalize(&engine, &execution_id).await;
        return;
    }

    let mut exec = engine.registry.get(&execution_id).expect("just transitioned");

    let task = match engine.task_store.get_task(&exec.task_id).await {
        Ok(t) => t,
        Err(_) => {
            let _ = engine.registry.transition(
                &execution_id,
                ExecutionStatus::Failed,
                Some(json!({"reason": "task_not_found"})),
            );
            finalize(&engine, &execution_id).await;
            return;
        }
    };
    let _ = engine.task_store.update_task_status(&task.task_id, "IN_PROGRESS").await;

    let template_id = exec.workflow_type.clone();
    let pipeline = match engine.converter.convert(&task, &template_id, &exec.workflow_params) {
        Ok(p) => p,
        Err(e) => {
            let _ = engine.registry.transition(
                &execution_id,
                ExecutionStatus::Failed,
                Some(json!({"reason": "pipeline_conversion_failed", "detail": e.to_string()})),
            );
            finalize(&engine, &execution_id).await;
            return;
        }
    };

    if exec.workflow_id.is_none() {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let mut updated = exec.clone();
        updated.workflow_id = Some(workflow_id.clone());
        engine.registry.save(updated.clone());
        exec = updated;

        engine.statuses.create(&workflow_id, WorkflowState::Created, HashMap::new()).await;
    }

    call_hooks(&engine.pre_hooks, &exec);

    let _ = engine.registry.transition(&execution_id, ExecutionStatus::Running, None);
    exec = engine.registry.get(&execution_id).expect("just transitioned");
    if let Some(workflow_id) = exec.workflow_id.clone() {
        engine.statuses.update_state(&workflow_id, WorkflowState::Running, json!({})).await.ok();
    }

    run_pipeline(&engine, &execution_id, &mut exec, &task, pipeline, cancel).await;

    finalize(&engine, &execution_id).await;
}

async fn run_pipeline(
    engine: &Arc<Engine>,
    execution_id: &str,
    exec: &mut TaskExecution,
    task: &crate::ports::TaskSnapshot,
    pipeline: crate::models::Pipeline,
    cancel: CancelHandle,
) {
    let skip_cache = exec.metadata.get("skip_cache").and_then(|v| v.as_bool()).unwrap_or(false);

    let raw = if cancel.is_cancelled() {
        None
    } else if !skip_cache {
        match engine.cache.get(&exec.task_id, &exec.workflow_type, &exec.workflow_params) {
            Some(cached) => Some(crate::ports::RawResult { success: true, payload: cached, error: None }),
            None => Some(engine.pipeline_runner.execute(&pipeline, cancel.clone()).await),
        }
    } else {
        Some(engine.pipeline_runner.execute(&pipeline, cancel.clone()).await)
    };

    if cancel.is_cancelled() || raw.is_none() {
        let _ = engine.registry.transition(execution_id, ExecutionStatus::Cancelled, Some(json!({"reason": "cancelled"})));
        let _ = engine.task_store.update_task_status(&task.task_id, "CANCELLED").await;
        if let Some(workflow_id) = &exec.workflow_id {
            engine.statuses.update_state(workflow_id, WorkflowState::Cancelled, json!({})).await.ok();
        }
        cascade_dependents(engine, execution_id, ExecutionStatus::Cancelled).await;
        return;
    }
    let raw = raw.unwrap();

    let schema_id = schema_id_for(&exec.workflow_type);
    let store_result = engine.results.store_result(
        exec.workflow_id.as_deref().unwrap_or(&exec.execution_id),
        Some(&exec.task_id),
        schema_id,
        raw.payload.clone(),
    );

    let (success, error) = match store_result {
        Ok(_) if raw.success => (true, None),
        Ok(_) => (false, raw.error.clone()),
        Err(e) => (false, Some(e.to_string())),
    };

    if success && !skip_cache {
        let _ = engine.cache.set(&exec.task_id, &exec.workflow_type, &exec.workflow_params, raw.payload.clone());
    }

    if success {
        let mut updated = exec.clone();
        updated.result = Some(raw.payload.clone());
        engine.registry.save(updated);
        let _ = engine.registry.transition(execution_id, ExecutionStatus::Completed, None);
        let _ = engine
            .task_store
            .update_task(&task.task_id, HashMap::from([
                ("status".to_string(), Value::String("COMPLETED".into())),
                ("progress".to_string(), Value::from(100)),
                ("result".to_string(), raw.payload),
            ]))
            .await;
        if let Some(workflow_id) = &exec.workflow_id {
            engine.statuses.update_state(workflow_id, WorkflowState::Completed, json!({})).await.ok();
        }
        cascade_dependents(engine, execution_id, ExecutionStatus::Completed).await;
        return;
    }

    let mut updated = exec.clone();
    updated.error = error.clone();
    engine.registry.save(updated);
    let failed_status = if exec.is_timed_out(Utc::now()) { ExecutionStatus::Timeout } else { ExecutionStatus::Failed };
    let _ = engine.registry.transition(execution_id, failed_status, Some(json!({"reason": "execution_failed"})));

    let mut after_transition = engine.registry.get(execution_id).expect("just transitioned");
    if retry::prepare_retry(&mut after_transition, Utc::now()) {
        let ready_time = after_transition.next_retry_at.unwrap_or_else(Utc::now);
        let priority = after_transition.priority;
        engine.registry.save(after_transition);
        engine.scheduler.push_delayed(execution_id.to_string(), priority, ready_time);
    } else {
        if after_transition.status != ExecutionStatus::Failed {
            let _ = engine.registry.transition(execution_id, ExecutionStatus::Failed, Some(json!({"reason": "retries_exhausted"})));
        }
        let _ = engine
            .task_store
            .update_task(&task.task_id, HashMap::from([
                ("status".to_string(), Value::String("FAILED".into())),
                ("error".to_string(), Value::String(error.unwrap_or_default())),
            ]))
            .await;
        if let Some(workflow_id) = &exec.workflow_id {
            engine.statuses.update_state(workflow_id, WorkflowState::Failed, json!({})).await.ok();
        }
        cascade_dependents(engine, execution_id, ExecutionStatus::Failed).await;
    }
}

async fn finalize(engine: &Arc<Engine>, execution_id: &str) {
    engine.scheduler.remove_running(execution_id);
    if let Ok(exec) = engine.registry.get(execution_id) {
        call_hooks(&engine.post_hooks, &exec);
    }
}

/// §4.5: wakes dependents on COMPLETED, cascades abandonment on
/// FAILED/CANCELLED (treated identically).
async fn cascade_dependents(engine: &Engine, execution_id: &str, outcome: ExecutionStatus) {
    let dependents = engine.dependency_graph.dependents_of(execution_id);

    for dependent_id in dependents {
        let Ok(dependent) = engine.registry.get(&dependent_id) else { continue };
        if dependent.status.is_terminal() {
            continue;
        }

        match outcome {
            ExecutionStatus::Completed => {
                let all_deps_done = dependent
                    .dependencies
                    .iter()
                    .all(|dep_id| engine.registry.get(dep_id).map(|d| d.status == ExecutionStatus::Completed).unwrap_or(false));
                if all_deps_done && dependent.can_execute() {
                    engine.scheduler.push_ready(dependent_id, dependent.priority);
                }
            }
            ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                if engine
                    .registry
                    .transition(
                        &dependent_id,
                        ExecutionStatus::Failed,
                        Some(json!({"reason": "dependency_failed", "source": execution_id})),
                    )
                    .is_ok()
                {
                    let _ = engine.task_store.update_task_status(&dependent.task_id, "FAILED").await;
                    if let Some(workflow_id) = &dependent.workflow_id {
                        engine.statuses.update_state(workflow_id, WorkflowState::Failed, json!({})).await.ok();
                    }
                    Box::pin(cascade_dependents(engine, &dependent_id, ExecutionStatus::Failed)).await;
                }
            }
            _ => {}
        }
    }
}

async fn scheduler_loop(engine: Arc<Engine>) {
    debug!("scheduler loop starting");
    loop {
        if engine.scheduler.shutdown.load(std::sync::atomic::Ordering::SeqCst) {
            break;
        }

        let now = Utc::now();

        for execution_id in engine.scheduler.timed_out(now) {
            handle_timeout(&engine, &execution_id).await;
        }

        engine.scheduler.promote_ready(now);

        while engine.scheduler.has_capacity() {
            match engine.scheduler.pop_ready() {
                Some(entry) => dispatch_one(&engine, entry.execution_id, entry.priority).await,
                None => break,
            }
        }

        tokio::select! {
            _ = engine.scheduler.notify.notified() => {}
            _ = tokio::time::sleep(engine.config.scheduler_interval()) => {}
        }
    }
    debug!("scheduler loop stopped");
}

async fn handle_timeout(engine: &Arc<Engine>, execution_id: &str) {
    if let Some(running) = engine.scheduler.remove_running(execution_id) {
        running.join_handle.abort();
    }

    let Ok(_) = engine.registry.transition(execution_id, ExecutionStatus::Timeout, Some(json!({"reason": "timeout"}))) else {
        return;
    };
    let mut exec = engine.registry.get(execution_id).expect("just transitioned");

    if retry::prepare_retry(&mut exec, Utc::now()) {
        let ready_time = exec.next_retry_at.unwrap_or_else(Utc::now);
        let priority = exec.priority;
        engine.registry.save(exec);
        engine.scheduler.push_delayed(execution_id.to_string(), priority, ready_time);
        return;
    }

    let _ = engine.registry.transition(execution_id, ExecutionStatus::Failed, Some(json!({"reason": "timeout"})));
    let _ = engine.task_store.update_task_status(&exec.task_id, "FAILED").await;
    if let Some(workflow_id) = &exec.workflow_id {
        engine.statuses.update_state(workflow_id, WorkflowState::Failed, json!({})).await.ok();
    }
    cascade_dependents(engine, execution_id, ExecutionStatus::Failed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline_converter::InMemoryTemplateRegistry;
    use crate::ports::fakes::{AlwaysSucceedRunner, InMemoryTaskStore, NoopNotifier};
    use crate::ports::TaskSnapshot;

    fn test_engine(dir: &std::path::Path) -> Arc<Engine> {
        let config = EngineConfig::builder().data_dir(dir).max_concurrent_executions(2).build();
        let task_store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let runner: Arc<dyn PipelineRunner> = Arc::new(AlwaysSucceedRunner);
        let notifier: Arc<dyn Notifier> = Arc::new(NoopNotifier);
        let templates: Arc<dyn TemplateRegistry> = Arc::new(InMemoryTemplateRegistry::new());
        Engine::new(config, task_store, runner, Some(notifier), templates).unwrap()
    }

    #[tokio::test]
    async fn schedule_task_rejects_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(dir.path());
        let err = engine
            .schedule_task(ScheduleTaskRequest { task_id: "missing".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn schedule_task_graph_detects_cycles() {
        let graph = HashMap::from([
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["a".to_string()]),
        ]);
        let err = topological_sort(&graph).unwrap_err();
        assert!(matches!(err, EngineError::CycleDetected));
    }

    #[tokio::test]
    async fn schedule_task_graph_orders_topologically() {
        let graph = HashMap::from([
            ("a".to_string(), vec![]),
            ("b".to_string(), vec!["a".to_string()]),
            ("c".to_string(), vec!["a".to_string(), "b".to_string()]),
        ]);
        let order = topological_sort(&graph).unwrap();
        assert_eq!(order.iter().position(|t| t == "a"), Some(0));
        assert!(order.iter().position(|t| t == "b").unwrap() < order.iter().position(|t| t == "c").unwrap());
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

    #[tokio::test]
    async fn schedule_task_enqueues_and_lists() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder().data_dir(dir.path()).max_concurrent_executions(2).build();
        let task_store = Arc::new(InMemoryTaskStore::new());
        insert_task(&task_store, "t1");
        let task_store_dyn: Arc<dyn TaskStore> = task_store;
        let runner: Arc<dyn PipelineRunner> = Arc::new(AlwaysSucceedRunner);
        let templates: Arc<dyn TemplateRegistry> = Arc::new(InMemoryTemplateRegistry::new());
        let engine = Engine::new(config, task_store_dyn, runner, None, templates).unwrap();

        let scheduled = engine
            .schedule_task(ScheduleTaskRequest { task_id: "t1".into(), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(scheduled.status, ExecutionStatus::Pending);

        let page = engine.list_executions(ListFilter::default(), 10, 0);
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn cancel_unscheduled_future_execution_marks_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::builder().data_dir(dir.path()).build();
        let task_store = Arc::new(InMemoryTaskStore::new());
        insert_task(&task_store, "t1");
        let task_store_dyn: Arc<dyn TaskStore> = task_store;
        let runner: Arc<dyn PipelineRunner> = Arc::new(AlwaysSucceedRunner);
        let templates: Arc<dyn TemplateRegistry> = Arc::new(InMemoryTemplateRegistry::new());
        let engine = Engine::new(config, task_store_dyn, runner, None, templates).unwrap();

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
}
