//! Job execution: task registry, per-job runner and the job service

pub mod registry;
pub mod runner;
pub mod service;

pub use registry::TaskRegistry;
pub use runner::{EventHandler, JobEvent, JobRunner, NextTask, Outcome};
pub use service::JobService;
