use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced at the engine's public boundary.
///
/// Step failures are deliberately absent: `submit` returns before execution
/// begins, so a failing step is only observable through the run's `error`
/// field once retries are exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow `{0}` is not registered")]
    UnknownWorkflow(String),

    #[error("workflow `{0}` is already registered")]
    DuplicateWorkflow(String),

    #[error("a run for workflow `{workflow_name}` and resource `{resource_id}` is already in flight")]
    ResourceBusy {
        workflow_name: String,
        resource_id: String,
    },

    #[error("invalid run input: {0}")]
    InvalidInput(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

/// A step function raised; recorded on the run and fed into the retry
/// decision, never silently swallowed.
#[derive(Debug, Error)]
#[error("step `{step}` failed: {message}")]
pub struct StepExecutionError {
    pub step: String,
    pub message: String,
}

/// One execution attempt exceeded the workflow's wall-clock budget. Counted
/// against retries exactly like a step failure.
#[derive(Debug, Error)]
#[error("run exceeded its execution timeout of {budget:?}")]
pub struct RunTimeoutError {
    pub budget: Duration,
}
