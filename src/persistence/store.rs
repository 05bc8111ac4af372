//! SQLite-based persistence store

use crate::core::{StatusRecord, TaskId, TaskStatus};
use crate::persistence::{StatusStore, TriggerConfigStore};
use crate::trigger::PipelineTriggerConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// SQLite store for job statuses and trigger configurations
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) a database file
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            // Every connection to :memory: is a separate database
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await
        } else {
            SqlitePoolOptions::new()
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(db_path)
                        .create_if_missing(true),
                )
                .await
        }
        .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Open the database at `path`, creating its directory
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                tokio::fs::create_dir_all(dir)
                    .await
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }
        }
        let path = path
            .to_str()
            .with_context(|| format!("Database path is not UTF-8: {}", path.display()))?;
        Self::new(path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_status (
                job_guid TEXT PRIMARY KEY,
                container TEXT NOT NULL,
                user_name TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                description TEXT NOT NULL,
                active_task_id TEXT,
                status TEXT NOT NULL,
                status_text TEXT NOT NULL,
                info TEXT,
                log_path TEXT NOT NULL,
                location TEXT NOT NULL,
                completed_tasks INTEGER NOT NULL DEFAULT 0,
                created TEXT NOT NULL,
                modified TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_job_status_container ON job_status(container);
            CREATE INDEX IF NOT EXISTS idx_job_status_status ON job_status(status);

            CREATE TABLE IF NOT EXISTS trigger_configs (
                id TEXT PRIMARY KEY,
                container TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                type_name TEXT NOT NULL,
                pipeline_id TEXT NOT NULL,
                enabled INTEGER NOT NULL,
                configuration TEXT NOT NULL,
                custom_configuration TEXT,
                last_checked TEXT,
                created TEXT NOT NULL,
                modified TEXT NOT NULL,
                UNIQUE (container, name)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Convert DateTime<Utc> to NaiveDateTime for SQLite
    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    /// Convert NaiveDateTime to DateTime<Utc>
    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn parse_task_id(s: &str) -> Result<TaskId> {
        TaskId::from_str(s).map_err(anyhow::Error::msg)
    }

    fn status_from_row(row: &SqliteRow) -> Result<StatusRecord> {
        let active_task_id = row
            .get::<Option<String>, _>("active_task_id")
            .map(|s| Self::parse_task_id(&s))
            .transpose()?;

        Ok(StatusRecord {
            job_guid: Uuid::parse_str(&row.get::<String, _>("job_guid"))?,
            container: row.get("container"),
            user: row.get("user_name"),
            pipeline_id: Self::parse_task_id(&row.get::<String, _>("pipeline_id"))?,
            description: row.get("description"),
            active_task_id,
            status: TaskStatus::from_str(&row.get::<String, _>("status"))?,
            status_text: row.get("status_text"),
            info: row.get("info"),
            log_path: row.get("log_path"),
            location: row.get("location"),
            completed_tasks: row.get::<i64, _>("completed_tasks") as usize,
            created: Self::from_naive(row.get("created")),
            modified: Self::from_naive(row.get("modified")),
        })
    }

    fn trigger_from_row(row: &SqliteRow) -> Result<PipelineTriggerConfig> {
        let custom_configuration = row
            .get::<Option<String>, _>("custom_configuration")
            .map(|s| serde_json::from_str(&s))
            .transpose()?;

        Ok(PipelineTriggerConfig {
            id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            container: row.get("container"),
            name: row.get("name"),
            description: row.get("description"),
            type_name: row.get("type_name"),
            pipeline_id: Self::parse_task_id(&row.get::<String, _>("pipeline_id"))?,
            enabled: row.get::<i64, _>("enabled") != 0,
            configuration: serde_json::from_str(&row.get::<String, _>("configuration"))?,
            custom_configuration,
            last_checked: row
                .get::<Option<NaiveDateTime>, _>("last_checked")
                .map(Self::from_naive),
            created: Self::from_naive(row.get("created")),
            modified: Self::from_naive(row.get("modified")),
        })
    }
}

const STATUS_COLUMNS: &str = "job_guid, container, user_name, pipeline_id, description, \
     active_task_id, status, status_text, info, log_path, location, completed_tasks, \
     created, modified";

const TRIGGER_COLUMNS: &str = "id, container, name, description, type_name, pipeline_id, \
     enabled, configuration, custom_configuration, last_checked, created, modified";

#[async_trait::async_trait]
impl StatusStore for SqliteStore {
    async fn save_status(&self, record: &StatusRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO job_status ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            STATUS_COLUMNS
        ))
        .bind(record.job_guid.to_string())
        .bind(&record.container)
        .bind(&record.user)
        .bind(record.pipeline_id.to_string())
        .bind(&record.description)
        .bind(record.active_task_id.as_ref().map(|t| t.to_string()))
        .bind(record.status.as_str())
        .bind(&record.status_text)
        .bind(&record.info)
        .bind(&record.log_path)
        .bind(&record.location)
        .bind(record.completed_tasks as i64)
        .bind(Self::to_naive(record.created))
        .bind(Self::to_naive(record.modified))
        .execute(&self.pool)
        .await
        .context("Failed to save job status")?;

        Ok(())
    }

    async fn load_status(&self, job_guid: Uuid) -> Result<Option<StatusRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM job_status WHERE job_guid = ?1",
            STATUS_COLUMNS
        ))
        .bind(job_guid.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load job status")?;

        row.as_ref().map(Self::status_from_row).transpose()
    }

    async fn list_statuses(&self, container: Option<&str>) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_status \
             WHERE (?1 IS NULL OR container = ?1) \
             ORDER BY created DESC",
            STATUS_COLUMNS
        ))
        .bind(container)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list job statuses")?;

        rows.iter().map(Self::status_from_row).collect()
    }

    async fn list_active(&self) -> Result<Vec<StatusRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM job_status \
             WHERE status NOT IN ('COMPLETE', 'ERROR', 'CANCELLED') \
             ORDER BY created ASC",
            STATUS_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .context("Failed to list active jobs")?;

        rows.iter().map(Self::status_from_row).collect()
    }

    async fn delete_status(&self, job_guid: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM job_status WHERE job_guid = ?1")
            .bind(job_guid.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete job status")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl TriggerConfigStore for SqliteStore {
    async fn save_trigger(&self, config: &PipelineTriggerConfig) -> Result<()> {
        let custom = config
            .custom_configuration
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO trigger_configs ({}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            TRIGGER_COLUMNS
        ))
        .bind(config.id.to_string())
        .bind(&config.container)
        .bind(&config.name)
        .bind(&config.description)
        .bind(&config.type_name)
        .bind(config.pipeline_id.to_string())
        .bind(config.enabled as i64)
        .bind(serde_json::to_string(&config.configuration)?)
        .bind(custom)
        .bind(config.last_checked.map(Self::to_naive))
        .bind(Self::to_naive(config.created))
        .bind(Self::to_naive(config.modified))
        .execute(&self.pool)
        .await
        .context("Failed to save trigger configuration")?;

        Ok(())
    }

    async fn load_trigger(&self, id: Uuid) -> Result<Option<PipelineTriggerConfig>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM trigger_configs WHERE id = ?1",
            TRIGGER_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to load trigger configuration")?;

        row.as_ref().map(Self::trigger_from_row).transpose()
    }

    async fn find_triggers(
        &self,
        container: Option<&str>,
        type_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<PipelineTriggerConfig>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM trigger_configs \
             WHERE (?1 IS NULL OR container = ?1) \
               AND (?2 IS NULL OR type_name = ?2) \
               AND (?3 IS NULL OR name = ?3) \
             ORDER BY container ASC, name ASC",
            TRIGGER_COLUMNS
        ))
        .bind(container)
        .bind(type_name)
        .bind(name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to find trigger configurations")?;

        rows.iter().map(Self::trigger_from_row).collect()
    }

    async fn delete_trigger(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM trigger_configs WHERE id = ?1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to delete trigger configuration")?;

        Ok(())
    }
}
