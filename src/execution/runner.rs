//! Job runner - steps one job through its task pipeline

use crate::core::{
    PipelineJob, RecordedAction, RecordedActionSet, StatusUpdate, TaskContext, TaskFactory,
    TaskId, TaskStatus, LOCAL_LOCATION,
};
use crate::error::{PipelineJobError, StatusError, TaskError};
use crate::execution::TaskRegistry;
use crate::persistence::StatusManager;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Events that occur while jobs execute
#[derive(Debug, Clone)]
pub enum JobEvent {
    JobSubmitted {
        job_guid: Uuid,
        pipeline_id: TaskId,
    },
    TaskStarted {
        job_guid: Uuid,
        task_id: TaskId,
    },
    TaskSkipped {
        job_guid: Uuid,
        task_id: TaskId,
    },
    TaskCompleted {
        job_guid: Uuid,
        task_id: TaskId,
    },
    TaskFailed {
        job_guid: Uuid,
        task_id: TaskId,
        error: String,
    },
    JobHandedOff {
        job_guid: Uuid,
        task_id: TaskId,
        location: String,
    },
    JobFinished {
        job_guid: Uuid,
        status: TaskStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(JobEvent) + Send + Sync>;

/// Shared list of event handlers
pub type EventHandlers = Arc<Mutex<Vec<EventHandler>>>;

/// How a run of the job runner ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Every task finished
    Complete,
    /// A task failed or the job could not continue
    Failed { message: String },
    /// The job was cancelled
    Cancelled,
    /// The next task runs elsewhere
    HandOff { task_id: TaskId, location: String },
}

impl Outcome {
    /// Status the job is left in, if the run ended it
    pub fn final_status(&self) -> Option<TaskStatus> {
        match self {
            Outcome::Complete => Some(TaskStatus::Complete),
            Outcome::Failed { .. } => Some(TaskStatus::Error),
            Outcome::Cancelled => Some(TaskStatus::Cancelled),
            Outcome::HandOff { .. } => None,
        }
    }
}

/// Next step of a job's progression
pub enum NextTask {
    /// Run this task
    Run(Arc<dyn TaskFactory>),
    /// No tasks remain
    Done,
}

/// Runs a job's tasks in order, persisting every status transition
pub struct JobRunner {
    registry: Arc<TaskRegistry>,
    status: Arc<StatusManager>,
    handlers: EventHandlers,
}

impl JobRunner {
    pub fn new(registry: Arc<TaskRegistry>, status: Arc<StatusManager>) -> Self {
        Self {
            registry,
            status,
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handlers shared with the owner of this runner
    pub fn handlers(&self) -> EventHandlers {
        self.handlers.clone()
    }

    /// Emit an event to all handlers
    pub async fn emit_event(&self, event: JobEvent) {
        let handlers = self.handlers.lock().await;
        for handler in handlers.iter() {
            handler(event.clone());
        }
    }

    /// Move past tasks that are already done or do not apply to the job
    ///
    /// Tasks whose work is already complete are marked complete on the job
    /// and noted in its log. Non-participating tasks are passed over.
    pub async fn advance(&self, job: &mut PipelineJob) -> Result<NextTask, PipelineJobError> {
        let start = match (job.active_index(), job.active_task_status()) {
            (None, _) => 0,
            (Some(index), TaskStatus::Complete) => index + 1,
            (Some(index), _) => index,
        };

        let progression: Vec<TaskId> = job.pipeline().progression().to_vec();
        for task_id in progression.into_iter().skip(start) {
            let factory = self
                .registry
                .factory(&task_id)
                .ok_or_else(|| PipelineJobError::UnknownTask(task_id.clone()))?;

            if !factory.is_participant(job) {
                debug!("Task {} does not take part in job {}", task_id, job.guid);
                continue;
            }
            if factory.is_job_complete(job) {
                job.log.info(&format!("Skipping task {}: already complete", task_id)).await;
                job.set_active_task(Some(task_id.clone()), TaskStatus::Complete);
                self.emit_event(JobEvent::TaskSkipped {
                    job_guid: job.guid,
                    task_id,
                })
                .await;
                continue;
            }
            return Ok(NextTask::Run(factory));
        }

        Ok(NextTask::Done)
    }

    /// Run the job's local tasks until it ends or reaches a remote task
    ///
    /// Task errors never escape: they end the job in ERROR.
    pub async fn run(&self, job: &mut PipelineJob) -> Outcome {
        info!("Starting job {} ({})", job.guid, job.pipeline().id());

        loop {
            // Cancels arrive through the token or, from other processes, the status table
            if job.is_cancel_requested() || self.cancel_recorded(job).await {
                job.request_cancel();
                return self.finish_cancelled(job).await;
            }

            let factory = match self.advance(job).await {
                Ok(NextTask::Run(factory)) => factory,
                Ok(NextTask::Done) => return self.finish_complete(job).await,
                Err(e) => {
                    job.error(&e.to_string()).await;
                    return self.finish_failed(job, e.to_string()).await;
                }
            };

            let task_id = factory.id().clone();
            if !factory.is_local() {
                debug!("Job {} continues at '{}'", job.guid, factory.location());
                job.set_active_task(Some(task_id.clone()), TaskStatus::Waiting);
                return Outcome::HandOff {
                    task_id,
                    location: factory.location().to_string(),
                };
            }

            if let Some(outcome) = self.run_task(job, factory.as_ref()).await {
                return outcome;
            }
        }
    }

    /// Run one task; returns an outcome if the job must stop
    async fn run_task(&self, job: &mut PipelineJob, factory: &dyn TaskFactory) -> Option<Outcome> {
        let task_id = factory.id().clone();
        job.set_active_task(Some(task_id.clone()), TaskStatus::Running);

        let update = StatusUpdate::new(TaskStatus::Running)
            .with_task(Some(task_id.clone()), Some(factory.status_name()))
            .with_location(LOCAL_LOCATION)
            .with_completed_tasks(job.completed_tasks());
        if let Err(e) = self.persist(job, update).await {
            return Some(self.status_failure(job, e).await);
        }

        job.log.header(&format!("Starting task {}", task_id)).await;
        self.emit_event(JobEvent::TaskStarted {
            job_guid: job.guid,
            task_id: task_id.clone(),
        })
        .await;

        let ctx = TaskContext::new(job, task_id.clone());
        let mut task = factory.create_task(job);
        let result = task.run(&ctx).await;
        job.add_errors(ctx.error_count());

        match result {
            Ok(actions) if ctx.error_count() == 0 => {
                let actions = if actions.is_empty() {
                    RecordedActionSet::single(
                        RecordedAction::new(task_id.clone(), task_id.name.clone()).finish(),
                    )
                } else {
                    actions
                };
                job.record_actions(actions);
                job.mark_task_completed();
                job.set_active_status(TaskStatus::Complete);
                job.log.info(&format!("Task {} complete", task_id)).await;
                info!("Job {}: task {} complete", job.guid, task_id);
                self.emit_event(JobEvent::TaskCompleted {
                    job_guid: job.guid,
                    task_id,
                })
                .await;
                None
            }
            Ok(actions) => {
                job.record_actions(actions);
                let message = format!(
                    "Task {} logged {} error(s)",
                    task_id,
                    ctx.error_count()
                );
                Some(self.task_failed(job, task_id, message).await)
            }
            Err(TaskError::Cancelled) => {
                job.log.warn(&format!("Task {} cancelled", task_id)).await;
                Some(self.finish_cancelled(job).await)
            }
            Err(e) => {
                let message = format!("Task {} failed: {}", task_id, e);
                job.error(&message).await;
                Some(self.task_failed(job, task_id, message).await)
            }
        }
    }

    async fn task_failed(&self, job: &mut PipelineJob, task_id: TaskId, message: String) -> Outcome {
        error!("Job {}: {}", job.guid, message);
        self.emit_event(JobEvent::TaskFailed {
            job_guid: job.guid,
            task_id,
            error: message.clone(),
        })
        .await;
        self.finish_failed(job, message).await
    }

    async fn persist(&self, job: &PipelineJob, update: StatusUpdate) -> Result<(), StatusError> {
        self.status.set_status(job.guid, update).await.map(|_| ())
    }

    /// Whether the status table says the job is being cancelled
    async fn cancel_recorded(&self, job: &PipelineJob) -> bool {
        match self.status.get(job.guid).await {
            Ok(Some(record)) => matches!(
                record.status,
                TaskStatus::Cancelling | TaskStatus::Cancelled
            ),
            Ok(None) => false,
            Err(e) => {
                warn!("Job {}: failed to read status: {}", job.guid, e);
                false
            }
        }
    }

    /// A status write failed; a cancel may have raced the transition
    async fn status_failure(&self, job: &mut PipelineJob, e: StatusError) -> Outcome {
        if job.is_cancel_requested() || self.cancel_recorded(job).await {
            job.request_cancel();
            return self.finish_cancelled(job).await;
        }
        error!("Job {}: failed to record status: {}", job.guid, e);
        let message = format!("Failed to record status: {}", e);
        job.log.error(&message).await;
        self.finish_failed(job, message).await
    }

    async fn finish_complete(&self, job: &mut PipelineJob) -> Outcome {
        let update = StatusUpdate::new(TaskStatus::Complete)
            .with_location(LOCAL_LOCATION)
            .with_completed_tasks(job.completed_tasks());
        if let Err(e) = self.persist(job, update).await {
            return self.status_failure(job, e).await;
        }

        job.log.info("Job complete").await;
        info!("Job {} complete", job.guid);
        self.emit_event(JobEvent::JobFinished {
            job_guid: job.guid,
            status: TaskStatus::Complete,
        })
        .await;
        Outcome::Complete
    }

    async fn finish_failed(&self, job: &mut PipelineJob, message: String) -> Outcome {
        job.set_active_status(TaskStatus::Error);
        let update = StatusUpdate::new(TaskStatus::Error)
            .with_task(job.active_task_id().cloned(), None)
            .with_info(message.clone())
            .with_completed_tasks(job.completed_tasks());
        if let Err(e) = self.persist(job, update).await {
            warn!("Job {}: failed to record error status: {}", job.guid, e);
        }

        self.emit_event(JobEvent::JobFinished {
            job_guid: job.guid,
            status: TaskStatus::Error,
        })
        .await;
        Outcome::Failed { message }
    }

    async fn finish_cancelled(&self, job: &mut PipelineJob) -> Outcome {
        job.set_active_status(TaskStatus::Cancelled);
        let update = StatusUpdate::new(TaskStatus::Cancelled)
            .with_task(job.active_task_id().cloned(), None)
            .with_info("Cancelled")
            .with_completed_tasks(job.completed_tasks());
        if let Err(e) = self.persist(job, update).await {
            warn!("Job {}: failed to record cancellation: {}", job.guid, e);
        }

        job.log.warn("Job cancelled").await;
        info!("Job {} cancelled", job.guid);
        self.emit_event(JobEvent::JobFinished {
            job_guid: job.guid,
            status: TaskStatus::Cancelled,
        })
        .await;
        Outcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{
        JobLog, JobRequest, PipeRoot, RecordedAction, RecordedActionSet, Task, TaskPipeline,
    };
    use crate::persistence::InMemoryStore;
    use async_trait::async_trait;

    /// Task that succeeds, fails or logs an error depending on its mode
    struct ScriptedFactory {
        id: TaskId,
        mode: &'static str,
        location: &'static str,
        status: Arc<StatusManager>,
    }

    struct ScriptedTask {
        id: TaskId,
        mode: &'static str,
        status: Arc<StatusManager>,
    }

    #[async_trait]
    impl Task for ScriptedTask {
        async fn run(&mut self, ctx: &TaskContext) -> Result<RecordedActionSet, TaskError> {
            match self.mode {
                "fail" => Err(TaskError::failed("boom")),
                "log-error" => {
                    ctx.error("something went wrong").await;
                    Ok(RecordedActionSet::new())
                }
                "empty" => Ok(RecordedActionSet::new()),
                // Another process cancels the job while this task runs
                "cancel-elsewhere" => {
                    self.status
                        .set_status(ctx.job_guid, StatusUpdate::new(TaskStatus::Cancelling))
                        .await
                        .unwrap();
                    Ok(RecordedActionSet::single(
                        RecordedAction::new(self.id.clone(), "scripted").finish(),
                    ))
                }
                _ => Ok(RecordedActionSet::single(
                    RecordedAction::new(self.id.clone(), "scripted").finish(),
                )),
            }
        }
    }

    impl TaskFactory for ScriptedFactory {
        fn id(&self) -> &TaskId {
            &self.id
        }

        fn location(&self) -> &str {
            self.location
        }

        fn create_task(&self, _job: &PipelineJob) -> Box<dyn Task> {
            Box::new(ScriptedTask {
                id: self.id.clone(),
                mode: self.mode,
                status: self.status.clone(),
            })
        }

        fn is_job_complete(&self, _job: &PipelineJob) -> bool {
            self.mode == "done"
        }

        fn is_participant(&self, _job: &PipelineJob) -> bool {
            self.mode != "absent"
        }
    }

    struct Fixture {
        runner: JobRunner,
        status: Arc<StatusManager>,
        job: PipelineJob,
        _dir: tempfile::TempDir,
    }

    async fn fixture(tasks: &[(&str, &'static str, &'static str)]) -> Fixture {
        let status = Arc::new(StatusManager::new(Arc::new(InMemoryStore::new())));
        let mut registry = TaskRegistry::new();
        for (name, mode, location) in tasks {
            registry
                .register_factory(Arc::new(ScriptedFactory {
                    id: TaskId::task(*name),
                    mode: *mode,
                    location: *location,
                    status: status.clone(),
                }))
                .unwrap();
        }
        let pipeline = TaskPipeline::new(
            TaskId::pipeline("p"),
            "test",
            tasks.iter().map(|(name, _, _)| TaskId::task(*name)).collect(),
        )
        .unwrap();
        let pipeline = Arc::new(pipeline);

        let dir = tempfile::tempdir().unwrap();
        let job = PipelineJob::new(
            JobRequest::new(TaskId::pipeline("p"), "home", "tester"),
            pipeline,
            PipeRoot::new("home", dir.path()),
            JobLog::new(dir.path().join("job.log")),
        );

        status.create(&job.initial_record()).await.unwrap();

        Fixture {
            runner: JobRunner::new(Arc::new(registry), status.clone()),
            status,
            job,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_runs_all_tasks_to_complete() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION), ("b", "ok", LOCAL_LOCATION)]).await;

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(f.job.actions().task_count(), 2);

        let record = f.status.require(f.job.guid).await.unwrap();
        assert_eq!(record.status, TaskStatus::Complete);
        assert_eq!(record.completed_tasks, 2);
    }

    #[tokio::test]
    async fn test_halts_at_first_failure() {
        let mut f = fixture(&[
            ("a", "ok", LOCAL_LOCATION),
            ("b", "fail", LOCAL_LOCATION),
            ("c", "ok", LOCAL_LOCATION),
        ])
        .await;

        let outcome = f.runner.run(&mut f.job).await;
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(f.job.actions().task_count(), 1);
        assert!(!f.job.actions().contains_task(&TaskId::task("c")));

        let record = f.status.require(f.job.guid).await.unwrap();
        assert_eq!(record.status, TaskStatus::Error);
        assert_eq!(record.active_task_id, Some(TaskId::task("b")));
        assert!(record.info.unwrap().contains("boom"));
        assert!(f.job.log.contents().await.contains("boom"));
    }

    #[tokio::test]
    async fn test_logged_error_fails_job() {
        let mut f = fixture(&[("a", "log-error", LOCAL_LOCATION)]).await;

        let outcome = f.runner.run(&mut f.job).await;
        assert!(matches!(outcome, Outcome::Failed { .. }));
        assert_eq!(f.job.errors(), 1);
    }

    #[tokio::test]
    async fn test_skips_complete_and_absent_tasks() {
        let mut f = fixture(&[
            ("a", "done", LOCAL_LOCATION),
            ("b", "absent", LOCAL_LOCATION),
            ("c", "ok", LOCAL_LOCATION),
        ])
        .await;

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(f.job.actions().task_count(), 1);
        assert!(f.job.log.contents().await.contains("Skipping task task:a"));
    }

    #[tokio::test]
    async fn test_hands_off_remote_task() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION), ("b", "ok", "cluster")]).await;

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(
            outcome,
            Outcome::HandOff {
                task_id: TaskId::task("b"),
                location: "cluster".to_string()
            }
        );
        assert_eq!(f.job.completed_tasks(), 1);
        assert_eq!(f.job.active_task_id(), Some(&TaskId::task("b")));
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION)]).await;
        f.job.request_cancel();

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(f.job.actions().is_empty());
        assert_eq!(
            f.status.require(f.job.guid).await.unwrap().status,
            TaskStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_recorded_in_status_table_stops_job() {
        let mut f = fixture(&[
            ("a", "cancel-elsewhere", LOCAL_LOCATION),
            ("b", "ok", LOCAL_LOCATION),
        ])
        .await;

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(f.job.is_cancel_requested());
        assert!(!f.job.actions().contains_task(&TaskId::task("b")));

        let record = f.status.require(f.job.guid).await.unwrap();
        assert_eq!(record.status, TaskStatus::Cancelled);
        assert_ne!(record.active_task_id, Some(TaskId::task("b")));
    }

    #[tokio::test]
    async fn test_cancelled_record_before_start() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION)]).await;
        f.status
            .set_status(f.job.guid, StatusUpdate::new(TaskStatus::Cancelled))
            .await
            .unwrap();

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Cancelled);
        assert!(f.job.actions().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_status_write_fails_job() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION)]).await;
        f.status
            .set_status(f.job.guid, StatusUpdate::new(TaskStatus::Error))
            .await
            .unwrap();

        let outcome = f.runner.run(&mut f.job).await;
        assert!(matches!(outcome, Outcome::Failed { message } if message.contains("Failed to record status")));
        assert!(f.job.actions().is_empty());
        assert_eq!(
            f.status.require(f.job.guid).await.unwrap().status,
            TaskStatus::Error
        );
        assert!(f.job.log.contents().await.contains("Failed to record status"));
    }

    #[tokio::test]
    async fn test_task_without_actions_still_counts() {
        let mut f = fixture(&[("a", "empty", LOCAL_LOCATION), ("b", "ok", LOCAL_LOCATION)]).await;

        let outcome = f.runner.run(&mut f.job).await;
        assert_eq!(outcome, Outcome::Complete);
        assert_eq!(f.job.completed_tasks(), 2);
        assert_eq!(f.job.actions().task_count(), f.job.completed_tasks());
        assert!(f.job.actions().contains_task(&TaskId::task("a")));
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let mut f = fixture(&[("a", "ok", LOCAL_LOCATION)]).await;
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.runner
            .handlers()
            .lock()
            .await
            .push(Arc::new(move |event: JobEvent| sink.lock().unwrap().push(event)));

        f.runner.run(&mut f.job).await;

        let events = seen.lock().unwrap();
        assert!(matches!(events[0], JobEvent::TaskStarted { .. }));
        assert!(matches!(events[1], JobEvent::TaskCompleted { .. }));
        assert!(matches!(
            events[2],
            JobEvent::JobFinished {
                status: TaskStatus::Complete,
                ..
            }
        ));
    }
}
