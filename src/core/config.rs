//! Kernel configuration from YAML

use crate::core::{TaskId, TaskIdKind, LOCAL_LOCATION};
use crate::remote::EngineConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Service settings
    #[serde(default)]
    pub settings: Settings,

    /// Container -> pipe root directory
    #[serde(default)]
    pub roots: HashMap<String, String>,

    /// Command task definitions
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,

    /// Task pipeline definitions
    #[serde(default)]
    pub pipelines: Vec<PipelineDefinition>,

    /// Trigger configurations seeded into the trigger store
    #[serde(default)]
    pub triggers: Vec<TriggerDefinition>,

    /// Remote execution engines
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
}

/// Service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// SQLite database path (defaults to the local data directory)
    #[serde(default)]
    pub database: Option<String>,

    /// Maximum number of jobs running locally at once
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// Seconds between remote status reconciliation passes
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// What to do with a job whose remote submission fails
    #[serde(default)]
    pub on_submit_failure: SubmitFailurePolicy,

    /// Directory for job logs, relative to the pipe root
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: None,
            max_concurrent_jobs: default_max_concurrent_jobs(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            on_submit_failure: SubmitFailurePolicy::default(),
            log_dir: default_log_dir(),
        }
    }
}

impl Settings {
    /// Database path, falling back to `<data_local_dir>/pipejob/jobs.db`
    pub fn database_path(&self) -> PathBuf {
        match &self.database {
            Some(path) => PathBuf::from(path),
            None => dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pipejob")
                .join("jobs.db"),
        }
    }
}

/// Handling of a failed remote submission
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitFailurePolicy {
    /// Move the job to ERROR
    #[default]
    Error,
    /// Leave the job WAITING so it can be resubmitted
    LeaveWaiting,
}

/// A task that runs an external command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Task id (`name` or full `[module:]task:name[:version]`)
    pub id: String,

    /// Name shown in status text (defaults to the task name)
    #[serde(default)]
    pub status_name: Option<String>,

    /// Execution location (defaults to local)
    #[serde(default)]
    pub location: Option<String>,

    /// Program to run
    pub command: String,

    /// Arguments; `${name}` is replaced with job parameters
    #[serde(default)]
    pub args: Vec<String>,

    /// Output files relative to the pipe root; when all exist the task is skipped
    #[serde(default)]
    pub outputs: Vec<String>,

    /// Timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A task pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline id (`name` or full `[module:]pipeline:name[:version]`)
    pub id: String,

    /// Description used for jobs created from this pipeline
    #[serde(default)]
    pub description: Option<String>,

    /// Task ids in execution order
    pub tasks: Vec<String>,
}

/// A trigger configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerDefinition {
    /// Name, unique within the container
    pub name: String,

    /// Owning container
    pub container: String,

    /// Trigger type name, e.g. `file-watch`
    #[serde(rename = "type")]
    pub type_name: String,

    /// Pipeline to submit
    pub pipeline: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Type-specific configuration
    #[serde(default)]
    pub configuration: serde_json::Value,

    /// Extra job parameters
    #[serde(default)]
    pub custom_configuration: Option<serde_json::Value>,
}

fn default_enabled() -> bool {
    true
}

impl TaskDefinition {
    pub fn task_id(&self) -> Result<TaskId> {
        TaskId::parse_with_default(&self.id, TaskIdKind::Task).map_err(anyhow::Error::msg)
    }
}

impl PipelineDefinition {
    pub fn pipeline_id(&self) -> Result<TaskId> {
        TaskId::parse_with_default(&self.id, TaskIdKind::Pipeline).map_err(anyhow::Error::msg)
    }
}

impl TriggerDefinition {
    pub fn pipeline_id(&self) -> Result<TaskId> {
        TaskId::parse_with_default(&self.pipeline, TaskIdKind::Pipeline)
            .map_err(anyhow::Error::msg)
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.settings.max_concurrent_jobs == 0 {
            anyhow::bail!("settings.max_concurrent_jobs must be at least 1");
        }

        // Check engine locations
        let mut locations = HashSet::new();
        for engine in &self.engines {
            if engine.location == LOCAL_LOCATION {
                anyhow::bail!("Engine location '{}' is reserved", engine.location);
            }
            if !locations.insert(engine.location.as_str()) {
                anyhow::bail!("Duplicate engine location: {}", engine.location);
            }
        }

        // Check that all task IDs are unique
        let mut task_ids = HashSet::new();
        for task in &self.tasks {
            let id = task.task_id()?;
            if task.command.trim().is_empty() {
                anyhow::bail!("Task '{}' has an empty command", id);
            }
            if let Some(location) = &task.location {
                if location != LOCAL_LOCATION && !locations.contains(location.as_str()) {
                    anyhow::bail!("Task '{}' uses unknown location '{}'", id, location);
                }
            }
            if !task_ids.insert(id.clone()) {
                anyhow::bail!("Duplicate task ID: {}", id);
            }
        }

        // Check that pipelines are unique and only reference defined tasks
        let mut pipeline_ids = HashSet::new();
        for pipeline in &self.pipelines {
            let id = pipeline.pipeline_id()?;
            if !pipeline_ids.insert(id.clone()) {
                anyhow::bail!("Duplicate pipeline ID: {}", id);
            }
            if pipeline.tasks.is_empty() {
                anyhow::bail!("Pipeline '{}' has no tasks", id);
            }
            for task in &pipeline.tasks {
                let task_id =
                    TaskId::parse_with_default(task, TaskIdKind::Task).map_err(anyhow::Error::msg)?;
                if !task_ids.contains(&task_id) {
                    anyhow::bail!(
                        "Pipeline '{}' references non-existent task '{}'",
                        id,
                        task_id
                    );
                }
            }
        }

        // Check triggers
        let mut trigger_names = HashSet::new();
        for trigger in &self.triggers {
            if !trigger_names.insert((trigger.container.as_str(), trigger.name.as_str())) {
                anyhow::bail!(
                    "Duplicate trigger '{}' in container '{}'",
                    trigger.name,
                    trigger.container
                );
            }
            let pipeline_id = trigger.pipeline_id()?;
            if !pipeline_ids.contains(&pipeline_id) {
                anyhow::bail!(
                    "Trigger '{}' references non-existent pipeline '{}'",
                    trigger.name,
                    pipeline_id
                );
            }
            if !self.roots.contains_key(&trigger.container) {
                anyhow::bail!(
                    "Trigger '{}' is in container '{}' which has no pipeline root",
                    trigger.name,
                    trigger.container
                );
            }
        }

        Ok(())
    }
}
