//! Tasks, task factories and the record of what a task did

use crate::core::{job_log::JobLog, PipeRoot, PipelineJob, TaskId, LOCAL_LOCATION};
use crate::error::TaskError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

/// One unit of work inside a job's task pipeline
#[async_trait]
pub trait Task: Send {
    /// Run the task and report what it did
    async fn run(&mut self, ctx: &TaskContext) -> Result<RecordedActionSet, TaskError>;
}

/// Creates tasks bound to a job
pub trait TaskFactory: Send + Sync {
    /// Identity of the tasks this factory creates
    fn id(&self) -> &TaskId;

    /// Name shown in status text, e.g. `CONVERT` in `CONVERT RUNNING`
    fn status_name(&self) -> String {
        self.id().name.to_uppercase()
    }

    /// Where tasks from this factory execute
    fn location(&self) -> &str {
        LOCAL_LOCATION
    }

    /// Create a task for the job
    fn create_task(&self, job: &PipelineJob) -> Box<dyn Task>;

    /// Whether this task takes part in processing the job at all
    fn is_participant(&self, _job: &PipelineJob) -> bool {
        true
    }

    /// Whether the job's work for this task is already done
    fn is_job_complete(&self, _job: &PipelineJob) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        self.location() == LOCAL_LOCATION
    }
}

/// Runtime context handed to a running task
pub struct TaskContext {
    /// Job GUID
    pub job_guid: Uuid,

    /// Task being run
    pub task_id: TaskId,

    /// Container the job belongs to
    pub container: String,

    /// Job parameters
    pub parameters: BTreeMap<String, String>,

    /// File-system root for the job
    pub pipe_root: PipeRoot,

    /// Job log
    pub log: JobLog,

    cancel: CancellationToken,
    errors: AtomicUsize,
}

impl TaskContext {
    pub fn new(job: &PipelineJob, task_id: TaskId) -> Self {
        Self {
            job_guid: job.guid,
            task_id,
            container: job.container.clone(),
            parameters: job.parameters.clone(),
            pipe_root: job.pipe_root.clone(),
            log: job.log.clone(),
            cancel: job.cancellation_token(),
            errors: AtomicUsize::new(0),
        }
    }

    /// Check whether cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Future that resolves once cancellation is requested
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Return `Err(TaskError::Cancelled)` if cancellation has been requested
    pub fn checkpoint(&self) -> Result<(), TaskError> {
        if self.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    pub async fn info(&self, message: &str) {
        self.log.info(message).await;
    }

    pub async fn warn(&self, message: &str) {
        self.log.warn(message).await;
    }

    /// Log an error; the job ends in ERROR even if the task returns Ok
    pub async fn error(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        self.log.error(message).await;
    }

    pub fn error_count(&self) -> usize {
        self.errors.load(Ordering::SeqCst)
    }
}

/// Record of one action performed by a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    /// Task that performed the action
    pub task_id: TaskId,

    /// Action name
    pub name: String,

    /// Files read
    #[serde(default)]
    pub inputs: Vec<PathBuf>,

    /// Files written
    #[serde(default)]
    pub outputs: Vec<PathBuf>,

    /// Parameters the action ran with
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,

    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
}

impl RecordedAction {
    pub fn new(task_id: TaskId, name: impl Into<String>) -> Self {
        Self {
            task_id,
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            parameters: BTreeMap::new(),
            started: Utc::now(),
            ended: None,
        }
    }

    pub fn add_input(&mut self, path: impl Into<PathBuf>) {
        self.inputs.push(path.into());
    }

    pub fn add_output(&mut self, path: impl Into<PathBuf>) {
        self.outputs.push(path.into());
    }

    pub fn add_parameter(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.parameters.insert(key.into(), value.into());
    }

    /// Mark the action as finished now
    pub fn finish(mut self) -> Self {
        self.ended = Some(Utc::now());
        self
    }
}

/// Ordered set of recorded actions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedActionSet {
    actions: Vec<RecordedAction>,
}

impl RecordedActionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(action: RecordedAction) -> Self {
        Self {
            actions: vec![action],
        }
    }

    pub fn add(&mut self, action: RecordedAction) {
        self.actions.push(action);
    }

    pub fn extend(&mut self, other: RecordedActionSet) {
        self.actions.extend(other.actions);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordedAction> {
        self.actions.iter()
    }

    /// Number of distinct tasks that recorded at least one action
    pub fn task_count(&self) -> usize {
        self.actions
            .iter()
            .map(|a| &a.task_id)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Check if the given task recorded anything
    pub fn contains_task(&self, task_id: &TaskId) -> bool {
        self.actions.iter().any(|a| &a.task_id == task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_count_counts_distinct_tasks() {
        let mut set = RecordedActionSet::new();
        set.add(RecordedAction::new(TaskId::task("a"), "first").finish());
        set.add(RecordedAction::new(TaskId::task("a"), "second").finish());
        set.add(RecordedAction::new(TaskId::task("b"), "third").finish());

        assert_eq!(set.len(), 3);
        assert_eq!(set.task_count(), 2);
        assert!(set.contains_task(&TaskId::task("b")));
        assert!(!set.contains_task(&TaskId::task("c")));
    }

    #[test]
    fn test_recorded_action_finish_sets_end() {
        let mut action = RecordedAction::new(TaskId::task("convert"), "convert");
        action.add_input("in.raw");
        action.add_output("out.mzxml");
        action.add_parameter("mode", "fast");
        let action = action.finish();

        assert!(action.ended.is_some());
        assert_eq!(action.inputs, vec![PathBuf::from("in.raw")]);
        assert_eq!(action.parameters.get("mode").map(String::as_str), Some("fast"));
    }
}
