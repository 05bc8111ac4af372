//! Registry of task factories and task pipelines

use crate::core::command::CommandTaskFactory;
use crate::core::config::PipelineConfig;
use crate::core::{TaskFactory, TaskId, TaskPipeline};
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

/// Task factories and pipelines keyed by id
#[derive(Default)]
pub struct TaskRegistry {
    factories: HashMap<TaskId, Arc<dyn TaskFactory>>,
    pipelines: HashMap<TaskId, Arc<TaskPipeline>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from the command tasks and pipelines in a configuration
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for def in &config.tasks {
            registry.register_factory(Arc::new(CommandTaskFactory::from_definition(def)?))?;
        }
        for def in &config.pipelines {
            registry.register_pipeline(TaskPipeline::from_definition(def)?)?;
        }
        Ok(registry)
    }

    /// Register a task factory; ids must be unique
    pub fn register_factory(&mut self, factory: Arc<dyn TaskFactory>) -> Result<()> {
        let id = factory.id().clone();
        if id.is_pipeline() {
            anyhow::bail!("'{}' is a pipeline id, not a task id", id);
        }
        if self.factories.contains_key(&id) {
            anyhow::bail!("Task factory '{}' is already registered", id);
        }
        self.factories.insert(id, factory);
        Ok(())
    }

    /// Register a pipeline; every task in it must already have a factory
    pub fn register_pipeline(&mut self, pipeline: TaskPipeline) -> Result<()> {
        let id = pipeline.id().clone();
        if self.pipelines.contains_key(&id) {
            anyhow::bail!("Task pipeline '{}' is already registered", id);
        }
        if let Some(missing) = pipeline
            .progression()
            .iter()
            .find(|task| !self.factories.contains_key(task))
        {
            anyhow::bail!("Pipeline '{}' uses unregistered task '{}'", id, missing);
        }
        self.pipelines.insert(id, Arc::new(pipeline));
        Ok(())
    }

    pub fn factory(&self, id: &TaskId) -> Option<Arc<dyn TaskFactory>> {
        self.factories.get(id).cloned()
    }

    pub fn pipeline(&self, id: &TaskId) -> Option<Arc<TaskPipeline>> {
        self.pipelines.get(id).cloned()
    }

    /// All pipelines, sorted by id
    pub fn pipelines(&self) -> Vec<Arc<TaskPipeline>> {
        let mut pipelines: Vec<_> = self.pipelines.values().cloned().collect();
        pipelines.sort_by_key(|p| p.id().to_string());
        pipelines
    }
}
