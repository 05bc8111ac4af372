//! pipejob - pipeline job execution, remote dispatch and trigger kernel

pub mod cli;
pub mod core;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod remote;
pub mod trigger;

// Re-export commonly used types
pub use core::{
    JobRequest, PipelineJob, StatusRecord, StatusUpdate, Task, TaskContext, TaskFactory, TaskId,
    TaskPipeline, TaskStatus,
};
pub use error::{EngineError, PipelineJobError, StatusError, TaskError, TriggerError};
pub use execution::{JobEvent, JobService, Outcome, TaskRegistry};
pub use persistence::{InMemoryStore, StatusManager};
pub use remote::{DummyRemoteExecutionEngine, EngineRegistry, RemoteExecutionEngine, RemoteJobStatus};
pub use trigger::{JobSubmitter, PipelineTriggerConfig, PipelineTriggerRegistry, PipelineTriggerType};
