//! Error types shared across the job kernel

use crate::core::{TaskId, TaskStatus};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a task while it runs
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Task was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

/// Errors raised by the status state machine and its store
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Illegal status transition for job {job}: {from} -> {to}")]
    IllegalTransition {
        job: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No status record for job {0}")]
    NotFound(Uuid),

    #[error("Unknown status '{0}'")]
    UnknownStatus(String),

    #[error("Status store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Errors raised when creating, routing or submitting a job
#[derive(Debug, Error)]
pub enum PipelineJobError {
    #[error("Unknown task pipeline: {0}")]
    UnknownPipeline(TaskId),

    #[error("Unknown task factory: {0}")]
    UnknownTask(TaskId),

    #[error("No pipeline root configured for container '{0}'")]
    NoPipeRoot(String),

    #[error("No execution engine registered for location '{0}'")]
    NoEngine(String),

    #[error("Submission to '{location}' failed: {message}")]
    Submission { location: String, message: String },

    #[error("Job {0} is not known to this service")]
    UnknownJob(Uuid),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineJobError {
    pub fn submission(location: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineJobError::Submission {
            location: location.into(),
            message: message.into(),
        }
    }
}

/// Errors raised by the trigger registry and trigger types
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("A trigger type named '{0}' is already registered")]
    DuplicateType(String),

    #[error("Unknown trigger type '{0}'")]
    UnknownType(String),

    #[error("A trigger named '{name}' already exists in container '{container}'")]
    DuplicateName { container: String, name: String },

    #[error("No trigger configuration with id {0}")]
    NotFound(Uuid),

    #[error("Invalid trigger configuration: {0}")]
    InvalidConfig(String),

    #[error("Trigger store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Errors raised when registering a remote execution engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("An execution engine is already registered for location '{0}'")]
    DuplicateLocation(String),

    #[error("Location '{0}' is reserved for local execution")]
    ReservedLocation(String),
}
