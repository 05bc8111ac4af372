//! Job status state machine and the persisted status record

use crate::core::TaskId;
use crate::error::StatusError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Location name for tasks that run inside this process
pub const LOCAL_LOCATION: &str = "webserver";

/// Status of a job's active task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    /// Submitted, not yet started
    Waiting,
    /// A task is executing
    Running,
    /// All tasks finished
    Complete,
    /// A task failed
    Error,
    /// Cancellation requested, waiting for the job to reach a checkpoint
    Cancelling,
    /// Cancelled
    Cancelled,
}

impl TaskStatus {
    /// Check if the status is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Cancelled
        )
    }

    /// Check if the state machine allows moving from `self` to `next`
    ///
    /// `Running -> Running` is allowed so the active task can change.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Waiting, Running | Complete | Error | Cancelled) => true,
            (Running, Running | Complete | Error | Cancelling | Cancelled) => true,
            (Cancelling, Cancelled | Complete | Error) => true,
            _ => false,
        }
    }

    /// Upper-case name stored in the status table
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "WAITING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Complete => "COMPLETE",
            TaskStatus::Error => "ERROR",
            TaskStatus::Cancelling => "CANCELLING",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WAITING" => Ok(TaskStatus::Waiting),
            "RUNNING" => Ok(TaskStatus::Running),
            "COMPLETE" => Ok(TaskStatus::Complete),
            "ERROR" => Ok(TaskStatus::Error),
            "CANCELLING" => Ok(TaskStatus::Cancelling),
            "CANCELLED" => Ok(TaskStatus::Cancelled),
            _ => Err(StatusError::UnknownStatus(s.to_string())),
        }
    }
}

/// Build the display text for a status, e.g. `CONVERT RUNNING`
pub fn status_text(status: TaskStatus, status_name: Option<&str>) -> String {
    match status_name {
        Some(name) if status != TaskStatus::Error && !name.is_empty() => {
            format!("{} {}", name.to_uppercase(), status)
        }
        _ => status.to_string(),
    }
}

/// One row of the job status table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    /// Job GUID
    pub job_guid: Uuid,

    /// Container the job belongs to
    pub container: String,

    /// User who submitted the job
    pub user: String,

    /// Task pipeline the job runs
    pub pipeline_id: TaskId,

    /// Human-readable job description
    pub description: String,

    /// Task currently active (None once the job is done)
    pub active_task_id: Option<TaskId>,

    /// Current status
    pub status: TaskStatus,

    /// Display text, e.g. `CONVERT RUNNING`
    pub status_text: String,

    /// Error or cancellation message
    pub info: Option<String>,

    /// Path of the job log file
    pub log_path: String,

    /// Where the active task executes
    pub location: String,

    /// Number of tasks completed so far
    pub completed_tasks: usize,

    /// When the job was created
    pub created: DateTime<Utc>,

    /// Last status change
    pub modified: DateTime<Utc>,
}

impl StatusRecord {
    /// Check if the record is in a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the active task runs in a remote engine
    pub fn is_remote(&self) -> bool {
        self.location != LOCAL_LOCATION
    }
}

/// A requested change to a status record
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub status: TaskStatus,
    pub active_task_id: Option<TaskId>,
    pub status_name: Option<String>,
    pub info: Option<String>,
    pub location: Option<String>,
    pub completed_tasks: Option<usize>,
}

impl StatusUpdate {
    pub fn new(status: TaskStatus) -> Self {
        Self {
            status,
            active_task_id: None,
            status_name: None,
            info: None,
            location: None,
            completed_tasks: None,
        }
    }

    pub fn with_task(mut self, task_id: Option<TaskId>, status_name: Option<String>) -> Self {
        self.active_task_id = task_id;
        self.status_name = status_name;
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    pub fn with_completed_tasks(mut self, completed: usize) -> Self {
        self.completed_tasks = Some(completed);
        self
    }
}

/// Result of applying a `StatusUpdate`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The record changed
    Changed,
    /// The record was already in that terminal status
    Unchanged,
}

impl StatusRecord {
    /// Apply an update, enforcing the transition rules
    ///
    /// Re-applying the current terminal status is a no-op.
    pub fn apply(&mut self, update: &StatusUpdate) -> Result<Applied, StatusError> {
        if self.status.is_terminal() && self.status == update.status {
            return Ok(Applied::Unchanged);
        }

        // Waiting -> Waiting only refreshes task/location (e.g. resubmission)
        let refresh = self.status == TaskStatus::Waiting && update.status == TaskStatus::Waiting;
        if !refresh && !self.status.can_transition_to(update.status) {
            return Err(StatusError::IllegalTransition {
                job: self.job_guid,
                from: self.status,
                to: update.status,
            });
        }

        self.status = update.status;
        if update.active_task_id.is_some() || update.status == TaskStatus::Complete {
            self.active_task_id = update.active_task_id.clone();
        }
        self.status_text = status_text(update.status, update.status_name.as_deref());
        if update.info.is_some() {
            self.info = update.info.clone();
        }
        if let Some(location) = &update.location {
            self.location = location.clone();
        }
        if let Some(completed) = update.completed_tasks {
            self.completed_tasks = completed;
        }
        self.modified = Utc::now();

        Ok(Applied::Changed)
    }
}
