//! Status manager - the only writer of the job status table

use crate::core::{Applied, StatusRecord, StatusUpdate, TaskStatus, LOCAL_LOCATION};
use crate::error::StatusError;
use crate::persistence::StatusStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// Info recorded on jobs found running after a restart
pub const INTERRUPTED_INFO: &str = "INTERRUPTED";

/// Applies status transitions to the persisted status table
///
/// Every transition is a load/apply/save under one lock, so a rejected
/// transition never reaches the store.
pub struct StatusManager {
    store: Arc<dyn StatusStore>,
    transition_lock: Mutex<()>,
}

impl StatusManager {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self {
            store,
            transition_lock: Mutex::new(()),
        }
    }

    /// Persist a newly created job
    pub async fn create(&self, record: &StatusRecord) -> Result<(), StatusError> {
        let _guard = self.transition_lock.lock().await;
        self.store.save_status(record).await?;
        Ok(())
    }

    /// Load the record for a job
    pub async fn get(&self, job_guid: Uuid) -> Result<Option<StatusRecord>, StatusError> {
        Ok(self.store.load_status(job_guid).await?)
    }

    /// Load the record for a job, failing if it does not exist
    pub async fn require(&self, job_guid: Uuid) -> Result<StatusRecord, StatusError> {
        self.get(job_guid)
            .await?
            .ok_or(StatusError::NotFound(job_guid))
    }

    /// Apply a status transition and persist it
    pub async fn set_status(
        &self,
        job_guid: Uuid,
        update: StatusUpdate,
    ) -> Result<Applied, StatusError> {
        let _guard = self.transition_lock.lock().await;

        let mut record = self
            .store
            .load_status(job_guid)
            .await?
            .ok_or(StatusError::NotFound(job_guid))?;

        let from = record.status;
        let applied = record.apply(&update)?;
        if applied == Applied::Changed {
            self.store.save_status(&record).await?;
            debug!("Job {} status {} -> {}", job_guid, from, record.status_text);
        }

        Ok(applied)
    }

    /// List records, newest first
    pub async fn list(&self, container: Option<&str>) -> Result<Vec<StatusRecord>, StatusError> {
        Ok(self.store.list_statuses(container).await?)
    }

    /// Records whose status is not terminal
    pub async fn active(&self) -> Result<Vec<StatusRecord>, StatusError> {
        Ok(self.store.list_active().await?)
    }

    /// Mark jobs left running locally by a previous process as failed
    ///
    /// Remote jobs are left alone; reconciliation will catch up with them.
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, StatusError> {
        let mut recovered = Vec::new();

        for record in self.active().await? {
            if record.location != LOCAL_LOCATION
                || !matches!(record.status, TaskStatus::Running | TaskStatus::Cancelling)
            {
                continue;
            }

            let update = StatusUpdate::new(TaskStatus::Error)
                .with_task(record.active_task_id.clone(), None)
                .with_info(INTERRUPTED_INFO);
            match self.set_status(record.job_guid, update).await {
                Ok(_) => {
                    warn!("Job {} was interrupted by a restart", record.job_guid);
                    recovered.push(record.job_guid);
                }
                Err(e) => warn!("Failed to recover job {}: {}", record.job_guid, e),
            }
        }

        Ok(recovered)
    }
}
