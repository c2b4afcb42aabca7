//! foreman: a dependency-aware priority scheduler and worker pool for
//! resilient task execution.
//!
//! [`Engine`] is the composition root; everything else is a component it
//! assembles. There is no global singleton — construct one `Engine` per
//! host process via [`Engine::new`].

pub mod config;
pub mod dependency_graph;
pub mod engine;
pub mod error;
pub mod executor;
pub mod models;
pub mod persistence;
pub mod pipeline_converter;
pub mod ports;
pub mod registry;
pub mod result_store;
pub mod retry;
pub mod scheduler;
pub mod workflow_cache;
pub mod workflow_status_manager;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{
    BatchResult, CancelOutcome, Engine, ExecutionStats, ExecutionView, GraphResult,
    ScheduleTaskRequest, ScheduledExecution,
};
pub use error::EngineError;
