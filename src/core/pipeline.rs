//! Task pipeline definition

use crate::core::{config::PipelineDefinition, TaskId, TaskIdKind};
use anyhow::Result;
use std::collections::HashSet;

/// Immutable ordered list of the tasks a job type runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPipeline {
    id: TaskId,
    description: String,
    progression: Vec<TaskId>,
}

impl TaskPipeline {
    /// Create a pipeline, rejecting empty or repeating progressions
    pub fn new(id: TaskId, description: impl Into<String>, progression: Vec<TaskId>) -> Result<Self> {
        if !id.is_pipeline() {
            anyhow::bail!("Pipeline id '{}' must be of kind 'pipeline'", id);
        }
        if progression.is_empty() {
            anyhow::bail!("Pipeline '{}' has no tasks", id);
        }

        let mut seen = HashSet::new();
        for task in &progression {
            if task.is_pipeline() {
                anyhow::bail!("Pipeline '{}' lists another pipeline '{}' as a task", id, task);
            }
            if !seen.insert(task) {
                anyhow::bail!("Pipeline '{}' lists task '{}' more than once", id, task);
            }
        }

        Ok(Self {
            id,
            description: description.into(),
            progression,
        })
    }

    /// Create a pipeline from its configuration
    pub fn from_definition(def: &PipelineDefinition) -> Result<Self> {
        let id = TaskId::parse_with_default(&def.id, TaskIdKind::Pipeline)
            .map_err(anyhow::Error::msg)?;
        let progression = def
            .tasks
            .iter()
            .map(|t| TaskId::parse_with_default(t, TaskIdKind::Task))
            .collect::<Result<Vec<_>, _>>()
            .map_err(anyhow::Error::msg)?;

        Self::new(id, def.description.clone().unwrap_or_default(), progression)
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Tasks in execution order
    pub fn progression(&self) -> &[TaskId] {
        &self.progression
    }

    pub fn len(&self) -> usize {
        self.progression.len()
    }

    pub fn is_empty(&self) -> bool {
        self.progression.is_empty()
    }

    /// Position of a task in the progression
    pub fn index_of(&self, task_id: &TaskId) -> Option<usize> {
        self.progression.iter().position(|t| t == task_id)
    }
}
