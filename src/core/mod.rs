//! Core domain models for pipeline jobs
//!
//! This module defines task identity, the status state machine, tasks and
//! task pipelines, jobs and their file-system roots, and configuration.

pub mod command;
pub mod config;
pub mod job;
pub mod job_log;
pub mod pipe_root;
pub mod pipeline;
pub mod status;
pub mod task;
pub mod task_id;

pub use job::*;
pub use job_log::JobLog;
pub use pipe_root::*;
pub use pipeline::*;
pub use status::*;
pub use task::*;
pub use task_id::*;
