//! Pipeline triggers: configurations, trigger types and their registry
//!
//! A trigger watches for an external event (a file arriving, a timer firing)
//! and submits a new job through a [`JobSubmitter`].

pub mod file_watch;
pub mod schedule;

pub use file_watch::{FileWatchConfig, FileWatchTriggerType};
pub use schedule::{ScheduleConfig, ScheduleTriggerType};

use crate::core::config::TriggerDefinition;
use crate::core::{JobRequest, PipeRoot, TaskId};
use crate::error::{PipelineJobError, TriggerError};
use crate::persistence::TriggerConfigStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// User recorded on jobs submitted by triggers
pub const TRIGGER_USER: &str = "pipeline-trigger";

/// A stored trigger configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineTriggerConfig {
    pub id: Uuid,

    /// Owning container
    pub container: String,

    /// Name, unique within the container
    pub name: String,

    pub description: Option<String>,

    /// Name of the trigger type that runs this configuration
    pub type_name: String,

    /// Pipeline submitted when the trigger fires
    pub pipeline_id: TaskId,

    pub enabled: bool,

    /// Type-specific configuration
    pub configuration: serde_json::Value,

    /// Extra job parameters, merged into every submitted job
    pub custom_configuration: Option<serde_json::Value>,

    /// Last time the trigger checked for work
    pub last_checked: Option<DateTime<Utc>>,

    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl PipelineTriggerConfig {
    /// Create an enabled configuration with a fresh id
    pub fn new(
        container: impl Into<String>,
        name: impl Into<String>,
        type_name: impl Into<String>,
        pipeline_id: TaskId,
        configuration: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            container: container.into(),
            name: name.into(),
            description: None,
            type_name: type_name.into(),
            pipeline_id,
            enabled: true,
            configuration,
            custom_configuration: None,
            last_checked: None,
            created: now,
            modified: now,
        }
    }

    /// Build a configuration from its YAML definition
    pub fn from_definition(def: &TriggerDefinition) -> anyhow::Result<Self> {
        let mut config = Self::new(
            def.container.clone(),
            def.name.clone(),
            def.type_name.clone(),
            def.pipeline_id()?,
            def.configuration.clone(),
        );
        config.description = def.description.clone();
        config.enabled = def.enabled;
        config.custom_configuration = def.custom_configuration.clone();
        Ok(config)
    }

    /// Check the configuration against optional filters
    pub fn matches(
        &self,
        container: Option<&str>,
        type_name: Option<&str>,
        name: Option<&str>,
    ) -> bool {
        container.map_or(true, |c| self.container == c)
            && type_name.map_or(true, |t| self.type_name == t)
            && name.map_or(true, |n| self.name == n)
    }

    /// Custom configuration as job parameters
    ///
    /// Only a JSON object contributes; non-string values use their JSON text.
    pub fn custom_parameters(&self) -> BTreeMap<String, String> {
        let mut parameters = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = &self.custom_configuration {
            for (key, value) in map {
                let value = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                parameters.insert(key.clone(), value);
            }
        }
        parameters
    }

    /// Start a job request for this trigger's pipeline
    pub fn job_request(&self, description: impl Into<String>) -> JobRequest {
        let mut request = JobRequest::new(
            self.pipeline_id.clone(),
            self.container.clone(),
            TRIGGER_USER,
        )
        .with_description(description)
        .with_parameter("triggerName", self.name.clone());
        request.parameters.extend(self.custom_parameters());
        request
    }
}

/// Something that accepts jobs from triggers
#[async_trait]
pub trait JobSubmitter: Send + Sync {
    /// Create and submit a job, returning its GUID
    async fn submit_request(&self, request: JobRequest) -> Result<Uuid, PipelineJobError>;

    /// Pipe root of a container, if one is configured
    fn pipe_root(&self, container: &str) -> Option<PipeRoot>;
}

/// A kind of trigger, e.g. file-watch
#[async_trait]
pub trait PipelineTriggerType: Send + Sync {
    /// Unique type name
    fn name(&self) -> &str;

    /// Check that the type can run a configuration
    fn validate_config(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError>;

    /// Begin watching for the configuration's events
    async fn start(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError>;

    /// Stop watching
    async fn stop(&self, config: &PipelineTriggerConfig);
}

/// Background watchers keyed by trigger configuration id
///
/// Starting an id that is already running and stopping one that is not are
/// both no-ops.
#[derive(Default)]
pub struct Watchers {
    running: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Watchers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a watcher unless one is already running; returns whether it spawned
    pub async fn start<F, Fut>(&self, id: Uuid, watcher: F) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut running = self.running.lock().await;
        if running.contains_key(&id) {
            return false;
        }
        let token = CancellationToken::new();
        tokio::spawn(watcher(token.clone()));
        running.insert(id, token);
        true
    }

    /// Cancel a watcher; returns whether one was running
    pub async fn stop(&self, id: Uuid) -> bool {
        match self.running.lock().await.remove(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self, id: Uuid) -> bool {
        self.running.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.running.lock().await.len()
    }
}

/// Record that a trigger has just checked for work
///
/// Skipped when the stored configuration has been replaced since the watcher
/// started.
pub async fn touch_last_checked(store: &dyn TriggerConfigStore, config: &PipelineTriggerConfig) {
    match store.load_trigger(config.id).await {
        Ok(Some(mut stored)) if stored.modified == config.modified => {
            stored.last_checked = Some(Utc::now());
            if let Err(e) = store.save_trigger(&stored).await {
                warn!("Failed to update last check of trigger '{}': {}", config.name, e);
            }
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to load trigger '{}': {}", config.name, e),
    }
}

/// Registry of trigger types and the store of their configurations
pub struct PipelineTriggerRegistry {
    types: RwLock<HashMap<String, Arc<dyn PipelineTriggerType>>>,
    store: Arc<dyn TriggerConfigStore>,
}

impl PipelineTriggerRegistry {
    pub fn new(store: Arc<dyn TriggerConfigStore>) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a trigger type; names must be unique
    pub async fn register(&self, trigger_type: Arc<dyn PipelineTriggerType>) -> Result<(), TriggerError> {
        let mut types = self.types.write().await;
        let name = trigger_type.name().to_string();
        if types.contains_key(&name) {
            return Err(TriggerError::DuplicateType(name));
        }
        debug!("Registered trigger type '{}'", name);
        types.insert(name, trigger_type);
        Ok(())
    }

    pub async fn get_type(&self, name: &str) -> Option<Arc<dyn PipelineTriggerType>> {
        self.types.read().await.get(name).cloned()
    }

    /// Registered type names, sorted
    pub async fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    async fn require_type(&self, name: &str) -> Result<Arc<dyn PipelineTriggerType>, TriggerError> {
        self.get_type(name)
            .await
            .ok_or_else(|| TriggerError::UnknownType(name.to_string()))
    }

    /// Find configurations; `None` arguments match anything
    pub async fn get_configs(
        &self,
        container: Option<&str>,
        type_name: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<PipelineTriggerConfig>, TriggerError> {
        Ok(self.store.find_triggers(container, type_name, name).await?)
    }

    pub async fn get_config(&self, id: Uuid) -> Result<PipelineTriggerConfig, TriggerError> {
        self.store
            .load_trigger(id)
            .await?
            .ok_or(TriggerError::NotFound(id))
    }

    /// Validate, persist and (re)start a configuration
    ///
    /// The previous version, if enabled, is stopped before the new one starts.
    pub async fn save_config(
        &self,
        mut config: PipelineTriggerConfig,
    ) -> Result<PipelineTriggerConfig, TriggerError> {
        let trigger_type = self.require_type(&config.type_name).await?;

        let clash = self
            .store
            .find_triggers(Some(&config.container), None, Some(&config.name))
            .await?
            .into_iter()
            .any(|existing| existing.id != config.id);
        if clash {
            return Err(TriggerError::DuplicateName {
                container: config.container.clone(),
                name: config.name.clone(),
            });
        }

        trigger_type.validate_config(&config)?;

        let previous = self.store.load_trigger(config.id).await?;
        if let Some(previous) = &previous {
            config.created = previous.created;
        }
        config.modified = Utc::now();
        self.store.save_trigger(&config).await?;

        if let Some(previous) = previous.filter(|p| p.enabled) {
            match self.get_type(&previous.type_name).await {
                Some(previous_type) => previous_type.stop(&previous).await,
                None => warn!("Trigger type '{}' is no longer registered", previous.type_name),
            }
        }
        if config.enabled {
            trigger_type.start(&config).await?;
        }

        info!(
            "Saved trigger '{}' in container '{}' ({})",
            config.name,
            config.container,
            if config.enabled { "enabled" } else { "disabled" }
        );
        Ok(config)
    }

    /// Stop and delete a configuration
    pub async fn delete_config(&self, id: Uuid) -> Result<(), TriggerError> {
        let config = self.get_config(id).await?;
        if config.enabled {
            if let Some(trigger_type) = self.get_type(&config.type_name).await {
                trigger_type.stop(&config).await;
            }
        }
        self.store.delete_trigger(id).await?;
        info!("Deleted trigger '{}' in container '{}'", config.name, config.container);
        Ok(())
    }

    /// Enable or disable a configuration
    pub async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<PipelineTriggerConfig, TriggerError> {
        let mut config = self.get_config(id).await?;
        if config.enabled == enabled {
            return Ok(config);
        }
        let trigger_type = self.require_type(&config.type_name).await?;

        config.enabled = enabled;
        config.modified = Utc::now();
        self.store.save_trigger(&config).await?;

        if enabled {
            trigger_type.start(&config).await?;
        } else {
            trigger_type.stop(&config).await;
        }
        Ok(config)
    }

    /// Save the triggers defined in YAML, matching existing ones by container and name
    pub async fn load_definitions(&self, definitions: &[TriggerDefinition]) -> Result<usize, TriggerError> {
        for def in definitions {
            let mut config = PipelineTriggerConfig::from_definition(def)
                .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
            let existing = self
                .store
                .find_triggers(Some(&def.container), None, Some(&def.name))
                .await?;
            if let Some(existing) = existing.into_iter().next() {
                config.id = existing.id;
                config.last_checked = existing.last_checked;
            }
            self.save_config(config).await?;
        }
        Ok(definitions.len())
    }

    /// Start every enabled configuration; failures are logged
    pub async fn start_all(&self) -> Result<usize, TriggerError> {
        let mut started = 0;
        for config in self.get_configs(None, None, None).await? {
            if !config.enabled {
                continue;
            }
            let Some(trigger_type) = self.get_type(&config.type_name).await else {
                warn!(
                    "Trigger '{}' uses unknown type '{}'",
                    config.name, config.type_name
                );
                continue;
            };
            match trigger_type.start(&config).await {
                Ok(()) => started += 1,
                Err(e) => warn!("Failed to start trigger '{}': {}", config.name, e),
            }
        }
        info!("Started {} trigger(s)", started);
        Ok(started)
    }

    /// Stop every enabled configuration
    pub async fn stop_all(&self) -> Result<(), TriggerError> {
        for config in self.get_configs(None, None, None).await? {
            if !config.enabled {
                continue;
            }
            if let Some(trigger_type) = self.get_type(&config.type_name).await {
                trigger_type.stop(&config).await;
            }
        }
        Ok(())
    }
}
