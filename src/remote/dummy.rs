//! In-memory remote engine for tests and dry runs

use crate::core::{PipelineJob, TaskId, TaskStatus};
use crate::error::PipelineJobError;
use crate::remote::{EngineConfig, RemoteExecutionEngine, RemoteJobStatus};
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Engine kind name
pub const DUMMY_KIND: &str = "dummy";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DummySettings {
    #[serde(default)]
    auto_complete: bool,
}

#[derive(Debug, Clone)]
struct HeldJob {
    task_id: Option<TaskId>,
    status: TaskStatus,
    info: Option<String>,
    submissions: usize,
}

/// Remote engine that holds jobs in memory
///
/// Statuses are scripted with [`set_status`](Self::set_status), or reported
/// as complete on the first poll when auto-complete is on.
pub struct DummyRemoteExecutionEngine {
    location: String,
    auto_complete: bool,
    jobs: Mutex<HashMap<Uuid, HeldJob>>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    cancel_calls: AtomicUsize,
    fail_submit: AtomicBool,
    fail_status: AtomicBool,
}

impl DummyRemoteExecutionEngine {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            auto_complete: false,
            jobs: Mutex::new(HashMap::new()),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            cancel_calls: AtomicUsize::new(0),
            fail_submit: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let settings: DummySettings = if config.settings.is_null() {
            DummySettings::default()
        } else {
            serde_json::from_value(config.settings.clone())?
        };
        Ok(Self::new(config.location.clone()).with_auto_complete(settings.auto_complete))
    }

    /// Report every held job as complete when polled
    pub fn with_auto_complete(mut self, auto_complete: bool) -> Self {
        self.auto_complete = auto_complete;
        self
    }

    /// Make submissions fail
    pub fn fail_submissions(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Make status polls fail
    pub fn fail_status_updates(&self, fail: bool) {
        self.fail_status.store(fail, Ordering::SeqCst);
    }

    /// Script the status reported for a held job
    pub async fn set_status(&self, job_guid: Uuid, status: TaskStatus, info: Option<&str>) {
        if let Some(job) = self.jobs.lock().await.get_mut(&job_guid) {
            job.status = status;
            job.info = info.map(str::to_string);
        }
    }

    pub async fn holds(&self, job_guid: Uuid) -> bool {
        self.jobs.lock().await.contains_key(&job_guid)
    }

    /// Status currently held for a job
    pub async fn status_of(&self, job_guid: Uuid) -> Option<TaskStatus> {
        self.jobs.lock().await.get(&job_guid).map(|j| j.status)
    }

    /// Task the job was last submitted for
    pub async fn task_of(&self, job_guid: Uuid) -> Option<TaskId> {
        self.jobs
            .lock()
            .await
            .get(&job_guid)
            .and_then(|j| j.task_id.clone())
    }

    /// Number of times a held job was submitted again
    pub async fn resubmission_count(&self, job_guid: Uuid) -> usize {
        self.jobs
            .lock()
            .await
            .get(&job_guid)
            .map_or(0, |j| j.submissions.saturating_sub(1))
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn cancel_calls(&self) -> usize {
        self.cancel_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteExecutionEngine for DummyRemoteExecutionEngine {
    fn location(&self) -> &str {
        &self.location
    }

    fn kind(&self) -> &str {
        DUMMY_KIND
    }

    async fn submit_job(&self, job: &PipelineJob) -> Result<(), PipelineJobError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(PipelineJobError::submission(&self.location, "engine unavailable"));
        }

        let mut jobs = self.jobs.lock().await;
        let held = jobs.entry(job.guid).or_insert_with(|| HeldJob {
            task_id: None,
            status: TaskStatus::Waiting,
            info: None,
            submissions: 0,
        });
        held.submissions += 1;
        held.task_id = job.active_task_id().cloned();
        held.status = TaskStatus::Waiting;
        held.info = None;

        if held.submissions > 1 {
            warn!(
                "Job {} resubmitted to '{}' ({} resubmission(s))",
                job.guid,
                self.location,
                held.submissions - 1
            );
        } else {
            debug!("Job {} submitted to '{}'", job.guid, self.location);
        }
        Ok(())
    }

    async fn update_status_for_jobs(
        &self,
        jobs: &[Uuid],
    ) -> Result<Vec<RemoteJobStatus>, PipelineJobError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(PipelineJobError::submission(&self.location, "status poll failed"));
        }

        let mut held = self.jobs.lock().await;
        let mut statuses = Vec::new();
        for guid in jobs {
            let Some(job) = held.get_mut(guid) else {
                continue;
            };
            if self.auto_complete && !job.status.is_terminal() {
                job.status = TaskStatus::Complete;
            }
            let mut status = RemoteJobStatus::new(*guid, job.status);
            status.info = job.info.clone();
            statuses.push(status);
        }
        Ok(statuses)
    }

    async fn cancel_job(&self, job_guid: Uuid) -> Result<(), PipelineJobError> {
        self.cancel_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(job) = self.jobs.lock().await.get_mut(&job_guid) {
            job.status = TaskStatus::Cancelled;
        }
        Ok(())
    }
}
