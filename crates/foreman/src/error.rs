//! Closed error taxonomy for every component boundary in the engine.

use thiserror::Error;

/// Errors raised by the Execution Registry (C6).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("execution {execution_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        execution_id: String,
        from: String,
        to: String,
    },

    #[error("dependency {0} does not reference an existing execution")]
    UnknownDependency(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the Pipeline Converter (C3).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("missing required parameter: {0}")]
    MissingParameter(String),

    #[error("parameter {name} has type {actual}, expected {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid pipeline document: {0}")]
    InvalidPipeline(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the Result Store (C1).
#[derive(Debug, Error)]
pub enum ResultStoreError {
    #[error("result failed schema validation: {0}")]
    InvalidResult(String),

    #[error("unknown schema: {0}")]
    UnknownSchema(String),

    #[error("unknown transformer: {0}")]
    UnknownTransformer(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the Workflow Cache (C2).
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors raised by the Workflow Status Manager (C4).
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("workflow status not found: {0}")]
    NotFound(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors surfaced by the external Task store port.
#[derive(Debug, Error)]
pub enum TaskStoreError {
    #[error("task not found: {0}")]
    NotFound(String),

    #[error("task store error: {0}")]
    Other(String),
}

/// The closed set of error codes surfaced through the Engine API (spec §6.4).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("dependency cycle detected")]
    CycleDetected,

    #[error("invalid result: {0}")]
    InvalidResult(String),

    #[error("execution is already terminal")]
    AlreadyTerminal,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RegistryError> for EngineError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(id) => EngineError::ExecutionNotFound(id),
            RegistryError::UnknownDependency(id) => {
                EngineError::InvalidParams(format!("unknown dependency: {id}"))
            }
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<PipelineError> for EngineError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::TemplateNotFound(id) => EngineError::TemplateNotFound(id),
            other => EngineError::InvalidParams(other.to_string()),
        }
    }
}

impl From<ResultStoreError> for EngineError {
    fn from(e: ResultStoreError) -> Self {
        match e {
            ResultStoreError::InvalidResult(msg) => EngineError::InvalidResult(msg),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<StatusError> for EngineError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::NotFound(id) => EngineError::Internal(format!("workflow status not found: {id}")),
            other => EngineError::Internal(other.to_string()),
        }
    }
}

impl From<TaskStoreError> for EngineError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(id) => EngineError::TaskNotFound(id),
            TaskStoreError::Other(msg) => EngineError::Internal(msg),
        }
    }
}
