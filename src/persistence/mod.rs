//! Persistence layer for job status records and trigger configurations

pub mod status_manager;

#[cfg(feature = "sqlite")]
pub mod store;

pub use status_manager::StatusManager;
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;

use crate::core::StatusRecord;
use crate::trigger::PipelineTriggerConfig;
use anyhow::Result;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Storage for the job status table
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    /// Insert or replace a record
    async fn save_status(&self, record: &StatusRecord) -> Result<()>;

    /// Load a record by job GUID
    async fn load_status(&self, job_guid: Uuid) -> Result<Option<StatusRecord>>;

    /// List records, newest first, optionally for one container
    async fn list_statuses(&self, container: Option<&str>) -> Result<Vec<StatusRecord>>;

    /// List records whose status is not terminal
    async fn list_active(&self) -> Result<Vec<StatusRecord>>;

    /// Delete a record
    async fn delete_status(&self, job_guid: Uuid) -> Result<()>;
}

/// Storage for trigger configurations
#[async_trait::async_trait]
pub trait TriggerConfigStore: Send + Sync {
    /// Insert or replace a configuration
    async fn save_trigger(&self, config: &PipelineTriggerConfig) -> Result<()>;

    /// Load a configuration by id
    async fn load_trigger(&self, id: Uuid) -> Result<Option<PipelineTriggerConfig>>;

    /// Find configurations; `None` arguments match anything
    async fn find_triggers(
        &self,
        container: Option<&str>,
        type_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<PipelineTriggerConfig>>;

    /// Delete a configuration
    async fn delete_trigger(&self, id: Uuid) -> Result<()>;
}

/// In-memory stores (for testing or ephemeral use)
pub struct InMemoryStore {
    statuses: RwLock<HashMap<Uuid, StatusRecord>>,
    triggers: RwLock<HashMap<Uuid, PipelineTriggerConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            triggers: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StatusStore for InMemoryStore {
    async fn save_status(&self, record: &StatusRecord) -> Result<()> {
        let mut statuses = self.statuses.write().await;
        statuses.insert(record.job_guid, record.clone());
        Ok(())
    }

    async fn load_status(&self, job_guid: Uuid) -> Result<Option<StatusRecord>> {
        let statuses = self.statuses.read().await;
        Ok(statuses.get(&job_guid).cloned())
    }

    async fn list_statuses(&self, container: Option<&str>) -> Result<Vec<StatusRecord>> {
        let statuses = self.statuses.read().await;
        let mut result: Vec<StatusRecord> = statuses
            .values()
            .filter(|r| container.map_or(true, |c| r.container == c))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(result)
    }

    async fn list_active(&self) -> Result<Vec<StatusRecord>> {
        let statuses = self.statuses.read().await;
        Ok(statuses
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn delete_status(&self, job_guid: Uuid) -> Result<()> {
        let mut statuses = self.statuses.write().await;
        statuses.remove(&job_guid);
        Ok(())
    }
}

#[async_trait::async_trait]
impl TriggerConfigStore for InMemoryStore {
    async fn save_trigger(&self, config: &PipelineTriggerConfig) -> Result<()> {
        let mut triggers = self.triggers.write().await;
        triggers.insert(config.id, config.clone());
        Ok(())
    }

    async fn load_trigger(&self, id: Uuid) -> Result<Option<PipelineTriggerConfig>> {
        let triggers = self.triggers.read().await;
        Ok(triggers.get(&id).cloned())
    }

    async fn find_triggers(
        &self,
        container: Option<&str>,
        type_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<PipelineTriggerConfig>> {
        let triggers = self.triggers.read().await;
        let mut result: Vec<PipelineTriggerConfig> = triggers
            .values()
            .filter(|t| t.matches(container, type_name, name))
            .cloned()
            .collect();
        result.sort_by(|a, b| (&a.container, &a.name).cmp(&(&b.container, &b.name)));
        Ok(result)
    }

    async fn delete_trigger(&self, id: Uuid) -> Result<()> {
        let mut triggers = self.triggers.write().await;
        triggers.remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TaskId, TaskStatus, LOCAL_LOCATION};
    use chrono::Utc;

    pub(crate) fn sample_record(container: &str, status: TaskStatus) -> StatusRecord {
        let now = Utc::now();
        StatusRecord {
            job_guid: Uuid::new_v4(),
            container: container.to_string(),
            user: "tester".to_string(),
            pipeline_id: TaskId::pipeline("p"),
            description: "sample".to_string(),
            active_task_id: Some(TaskId::task("a")),
            status,
            status_text: status.to_string(),
            info: None,
            log_path: "/tmp/sample.log".to_string(),
            location: LOCAL_LOCATION.to_string(),
            completed_tasks: 0,
            created: now,
            modified: now,
        }
    }

    #[tokio::test]
    async fn test_in_memory_status_roundtrip() {
        let store = InMemoryStore::new();
        let record = sample_record("home", TaskStatus::Waiting);
        store.save_status(&record).await.unwrap();

        let loaded = store.load_status(record.job_guid).await.unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_in_memory_list_filters() {
        let store = InMemoryStore::new();
        store.save_status(&sample_record("home", TaskStatus::Running)).await.unwrap();
        store.save_status(&sample_record("home", TaskStatus::Complete)).await.unwrap();
        store.save_status(&sample_record("lab", TaskStatus::Waiting)).await.unwrap();

        assert_eq!(store.list_statuses(None).await.unwrap().len(), 3);
        assert_eq!(store.list_statuses(Some("home")).await.unwrap().len(), 2);
        assert_eq!(store.list_active().await.unwrap().len(), 2);
    }
}
