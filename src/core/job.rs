//! Pipeline job: one unit of submitted work

use crate::core::{
    job_log::JobLog, status_text, PipeRoot, RecordedActionSet, StatusRecord, TaskId,
    TaskPipeline, TaskStatus, LOCAL_LOCATION,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Request to create a job
#[derive(Debug, Clone)]
pub struct JobRequest {
    /// Task pipeline to run
    pub pipeline_id: TaskId,

    /// Container the job belongs to
    pub container: String,

    /// Submitting user
    pub user: String,

    /// Description (defaults to the pipeline's description)
    pub description: Option<String>,

    /// Job parameters
    pub parameters: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new(pipeline_id: TaskId, container: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            pipeline_id,
            container: container.into(),
            user: user.into(),
            description: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// A submitted job and its in-memory progress
///
/// The persisted `StatusRecord` is the source of truth; this value is owned
/// by whichever execution context currently runs the job.
#[derive(Debug, Clone)]
pub struct PipelineJob {
    /// Job GUID
    pub guid: Uuid,

    /// Container the job belongs to
    pub container: String,

    /// Submitting user
    pub user: String,

    /// Description
    pub description: String,

    /// Job parameters
    pub parameters: BTreeMap<String, String>,

    /// File-system root
    pub pipe_root: PipeRoot,

    /// Job log file
    pub log: JobLog,

    pipeline: Arc<TaskPipeline>,
    active_task_id: Option<TaskId>,
    active_task_status: TaskStatus,
    errors: usize,
    completed_tasks: usize,
    actions: RecordedActionSet,
    cancel: CancellationToken,
    created: DateTime<Utc>,
}

impl PipelineJob {
    /// Create a waiting job
    pub fn new(
        request: JobRequest,
        pipeline: Arc<TaskPipeline>,
        pipe_root: PipeRoot,
        log: JobLog,
    ) -> Self {
        let description = request
            .description
            .unwrap_or_else(|| pipeline.description().to_string());

        Self {
            guid: Uuid::new_v4(),
            container: request.container,
            user: request.user,
            description,
            parameters: request.parameters,
            pipe_root,
            log,
            pipeline,
            active_task_id: None,
            active_task_status: TaskStatus::Waiting,
            errors: 0,
            completed_tasks: 0,
            actions: RecordedActionSet::new(),
            cancel: CancellationToken::new(),
            created: Utc::now(),
        }
    }

    /// Create a waiting job logging to `<log_dir>/<guid>.log` under its pipe root
    pub fn create(
        request: JobRequest,
        pipeline: Arc<TaskPipeline>,
        pipe_root: PipeRoot,
        log_dir: impl AsRef<Path>,
    ) -> Self {
        let guid = Uuid::new_v4();
        let log = JobLog::new(
            pipe_root
                .resolve(log_dir.as_ref())
                .join(format!("{}.log", guid)),
        );
        let mut job = Self::new(request, pipeline, pipe_root, log);
        job.guid = guid;
        job
    }

    pub fn pipeline(&self) -> &TaskPipeline {
        &self.pipeline
    }

    pub fn active_task_id(&self) -> Option<&TaskId> {
        self.active_task_id.as_ref()
    }

    pub fn active_task_status(&self) -> TaskStatus {
        self.active_task_status
    }

    /// Index of the active task in the progression
    pub fn active_index(&self) -> Option<usize> {
        self.active_task_id
            .as_ref()
            .and_then(|id| self.pipeline.index_of(id))
    }

    pub(crate) fn set_active_task(&mut self, task_id: Option<TaskId>, status: TaskStatus) {
        self.active_task_id = task_id;
        self.active_task_status = status;
    }

    pub(crate) fn set_active_status(&mut self, status: TaskStatus) {
        self.active_task_status = status;
    }

    pub fn errors(&self) -> usize {
        self.errors
    }

    pub(crate) fn add_errors(&mut self, count: usize) {
        self.errors += count;
        if count > 0 {
            self.active_task_status = TaskStatus::Error;
        }
    }

    /// Log an error and count it against the job
    pub async fn error(&mut self, message: &str) {
        self.add_errors(1);
        self.log.error(message).await;
    }

    pub fn completed_tasks(&self) -> usize {
        self.completed_tasks
    }

    pub(crate) fn mark_task_completed(&mut self) {
        self.completed_tasks += 1;
    }

    /// Everything the job's tasks have recorded so far
    pub fn actions(&self) -> &RecordedActionSet {
        &self.actions
    }

    pub(crate) fn record_actions(&mut self, actions: RecordedActionSet) {
        self.actions.extend(actions);
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the job to stop at its next checkpoint
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Initial status record for a freshly created job
    pub fn initial_record(&self) -> StatusRecord {
        StatusRecord {
            job_guid: self.guid,
            container: self.container.clone(),
            user: self.user.clone(),
            pipeline_id: self.pipeline.id().clone(),
            description: self.description.clone(),
            active_task_id: self.active_task_id.clone(),
            status: TaskStatus::Waiting,
            status_text: status_text(TaskStatus::Waiting, None),
            info: None,
            log_path: self.log.path().display().to_string(),
            location: LOCAL_LOCATION.to_string(),
            completed_tasks: 0,
            created: self.created,
            modified: self.created,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> PipelineJob {
        let pipeline = TaskPipeline::new(
            TaskId::pipeline("p"),
            "Test pipeline",
            vec![TaskId::task("a"), TaskId::task("b")],
        )
        .unwrap();
        PipelineJob::new(
            JobRequest::new(TaskId::pipeline("p"), "home", "tester").with_parameter("file", "x.raw"),
            Arc::new(pipeline),
            PipeRoot::new("home", "/tmp/home"),
            JobLog::new("/tmp/home/logs/job.log"),
        )
    }

    #[test]
    fn test_new_job_is_waiting() {
        let job = job();
        assert_eq!(job.active_task_status(), TaskStatus::Waiting);
        assert!(job.active_task_id().is_none());
        assert_eq!(job.description, "Test pipeline");
        assert_eq!(job.parameters.get("file").map(String::as_str), Some("x.raw"));

        let record = job.initial_record();
        assert_eq!(record.job_guid, job.guid);
        assert_eq!(record.status, TaskStatus::Waiting);
        assert_eq!(record.location, LOCAL_LOCATION);
    }

    #[test]
    fn test_cancel_token_shared_between_clones() {
        let job = job();
        let copy = job.clone();
        job.request_cancel();
        assert!(copy.is_cancel_requested());
    }

    #[test]
    fn test_create_places_log_under_root() {
        let pipeline = TaskPipeline::new(TaskId::pipeline("p"), "", vec![TaskId::task("a")]).unwrap();
        let job = PipelineJob::create(
            JobRequest::new(TaskId::pipeline("p"), "home", "tester"),
            Arc::new(pipeline),
            PipeRoot::new("home", "/tmp/home"),
            "logs",
        );
        assert_eq!(
            job.log_path(),
            Path::new(&format!("/tmp/home/logs/{}.log", job.guid))
        );
    }

    #[test]
    fn test_active_index() {
        let mut job = job();
        job.set_active_task(Some(TaskId::task("b")), TaskStatus::Waiting);
        assert_eq!(job.active_index(), Some(1));
    }
}
