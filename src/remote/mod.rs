//! Remote execution engines
//!
//! Tasks whose location is not the local one are handed to the engine
//! registered for that location. The engine owns the remote protocol; the
//! job service polls it for status and reconciles the local status table.

pub mod dummy;

pub use dummy::DummyRemoteExecutionEngine;

use crate::core::{PipelineJob, TaskStatus, LOCAL_LOCATION};
use crate::error::{EngineError, PipelineJobError};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Status of a job as reported by a remote engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteJobStatus {
    pub job_guid: Uuid,
    pub status: TaskStatus,
    /// Message from the remote system, e.g. an error description
    pub info: Option<String>,
}

impl RemoteJobStatus {
    pub fn new(job_guid: Uuid, status: TaskStatus) -> Self {
        Self {
            job_guid,
            status,
            info: None,
        }
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = Some(info.into());
        self
    }
}

/// An external system that runs tasks, e.g. a cluster scheduler
#[async_trait]
pub trait RemoteExecutionEngine: Send + Sync {
    /// Location served by this engine
    fn location(&self) -> &str;

    /// Engine kind, e.g. `dummy`
    fn kind(&self) -> &str;

    /// Hand the job's active task to the external system
    async fn submit_job(&self, job: &PipelineJob) -> Result<(), PipelineJobError>;

    /// Poll the external system for the given jobs
    ///
    /// Jobs the engine does not know are left out of the result.
    async fn update_status_for_jobs(
        &self,
        jobs: &[Uuid],
    ) -> Result<Vec<RemoteJobStatus>, PipelineJobError>;

    /// Ask the external system to stop a job (best effort)
    async fn cancel_job(&self, job_guid: Uuid) -> Result<(), PipelineJobError>;
}

/// Engine configuration loaded at startup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Location name tasks refer to
    pub location: String,

    /// Engine kind
    pub kind: String,

    /// Kind-specific settings
    #[serde(default)]
    pub settings: serde_json::Value,
}

/// Engines keyed by location
#[derive(Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn RemoteExecutionEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build engines from configuration
    pub fn from_configs(configs: &[EngineConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in configs {
            let engine: Arc<dyn RemoteExecutionEngine> = match config.kind.as_str() {
                dummy::DUMMY_KIND => Arc::new(DummyRemoteExecutionEngine::from_config(config)?),
                other => anyhow::bail!(
                    "Unknown engine kind '{}' for location '{}'",
                    other,
                    config.location
                ),
            };
            registry.register(engine)?;
        }
        Ok(registry)
    }

    /// Register an engine; its location must be unique and not local
    pub fn register(&mut self, engine: Arc<dyn RemoteExecutionEngine>) -> Result<(), EngineError> {
        let location = engine.location().to_string();
        if location == LOCAL_LOCATION {
            return Err(EngineError::ReservedLocation(location));
        }
        if self.engines.contains_key(&location) {
            return Err(EngineError::DuplicateLocation(location));
        }
        debug!("Registered {} engine for location '{}'", engine.kind(), location);
        self.engines.insert(location, engine);
        Ok(())
    }

    pub fn get(&self, location: &str) -> Option<Arc<dyn RemoteExecutionEngine>> {
        self.engines.get(location).cloned()
    }

    /// Registered locations, sorted
    pub fn locations(&self) -> Vec<String> {
        let mut locations: Vec<String> = self.engines.keys().cloned().collect();
        locations.sort();
        locations
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_location_rejected() {
        let mut registry = EngineRegistry::new();
        registry
            .register(Arc::new(DummyRemoteExecutionEngine::new("cluster")))
            .unwrap();

        let err = registry
            .register(Arc::new(DummyRemoteExecutionEngine::new("cluster")))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLocation(l) if l == "cluster"));
        assert_eq!(registry.locations(), vec!["cluster".to_string()]);
    }

    #[test]
    fn test_local_location_reserved() {
        let mut registry = EngineRegistry::new();
        let err = registry
            .register(Arc::new(DummyRemoteExecutionEngine::new(LOCAL_LOCATION)))
            .unwrap_err();
        assert!(matches!(err, EngineError::ReservedLocation(_)));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_from_configs() {
        let configs = vec![EngineConfig {
            location: "cluster".to_string(),
            kind: "dummy".to_string(),
            settings: serde_json::json!({ "autoComplete": true }),
        }];
        let registry = EngineRegistry::from_configs(&configs).unwrap();
        let engine = registry.get("cluster").unwrap();
        assert_eq!(engine.kind(), "dummy");

        let unknown = vec![EngineConfig {
            location: "grid".to_string(),
            kind: "lsf".to_string(),
            settings: serde_json::Value::Null,
        }];
        assert!(EngineRegistry::from_configs(&unknown).is_err());
    }
}
