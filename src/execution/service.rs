//! Job service - creates, routes, cancels and reconciles jobs

use crate::core::config::{Settings, SubmitFailurePolicy};
use crate::core::{
    JobRequest, PipeRoot, PipeRootRegistry, PipelineJob, RecordedAction, RecordedActionSet,
    StatusRecord, StatusUpdate, TaskFactory, TaskStatus,
};
use crate::error::{PipelineJobError, StatusError};
use crate::execution::runner::{EventHandlers, JobEvent, JobRunner, NextTask, Outcome};
use crate::execution::TaskRegistry;
use crate::persistence::StatusManager;
use crate::remote::{EngineRegistry, RemoteJobStatus};
use crate::trigger::JobSubmitter;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A job whose active task was handed to a remote engine
struct RemoteJob {
    job: PipelineJob,
    location: String,
}

struct ServiceInner {
    registry: Arc<TaskRegistry>,
    status: Arc<StatusManager>,
    engines: Arc<EngineRegistry>,
    roots: PipeRootRegistry,
    settings: Settings,
    runner: JobRunner,
    slots: Arc<Semaphore>,
    /// Worker handles of local jobs, taken by `wait`
    workers: Mutex<HashMap<Uuid, JoinHandle<Outcome>>>,
    /// Cancellation tokens of jobs executing locally
    executing: Mutex<HashMap<Uuid, CancellationToken>>,
    remote: Mutex<HashMap<Uuid, RemoteJob>>,
}

/// Entry point for submitting and managing jobs
///
/// Cloning is cheap; clones share the same worker pool and job tables.
#[derive(Clone)]
pub struct JobService {
    inner: Arc<ServiceInner>,
}

impl JobService {
    pub fn new(
        registry: Arc<TaskRegistry>,
        status: Arc<StatusManager>,
        engines: Arc<EngineRegistry>,
        roots: PipeRootRegistry,
        settings: Settings,
    ) -> Self {
        let runner = JobRunner::new(registry.clone(), status.clone());
        let slots = Arc::new(Semaphore::new(settings.max_concurrent_jobs.max(1)));
        Self {
            inner: Arc::new(ServiceInner {
                registry,
                status,
                engines,
                roots,
                settings,
                runner,
                slots,
                workers: Mutex::new(HashMap::new()),
                executing: Mutex::new(HashMap::new()),
                remote: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Add an event handler
    pub async fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.handlers().lock().await.push(Arc::new(handler));
    }

    pub fn handlers(&self) -> EventHandlers {
        self.inner.runner.handlers()
    }

    pub fn status_manager(&self) -> &Arc<StatusManager> {
        &self.inner.status
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    /// Create a job and persist its WAITING record
    pub async fn create_job(&self, request: JobRequest) -> Result<PipelineJob, PipelineJobError> {
        let pipeline = self
            .inner
            .registry
            .pipeline(&request.pipeline_id)
            .ok_or_else(|| PipelineJobError::UnknownPipeline(request.pipeline_id.clone()))?;
        let pipe_root = self
            .inner
            .roots
            .get(&request.container)
            .cloned()
            .ok_or_else(|| PipelineJobError::NoPipeRoot(request.container.clone()))?;

        let job = PipelineJob::create(request, pipeline, pipe_root, &self.inner.settings.log_dir);
        if let Some(dir) = job.log_path().parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        self.inner.status.create(&job.initial_record()).await?;
        job.log.info(&format!(
            "Job {} created for {} by {}",
            job.guid,
            job.pipeline().id(),
            job.user
        ))
        .await;
        debug!("Created job {} in container '{}'", job.guid, job.container);
        Ok(job)
    }

    /// Start a job on the location of its next task
    pub async fn submit(&self, job: PipelineJob) -> Result<Uuid, PipelineJobError> {
        let guid = job.guid;
        self.inner
            .runner
            .emit_event(JobEvent::JobSubmitted {
                job_guid: guid,
                pipeline_id: job.pipeline().id().clone(),
            })
            .await;
        self.dispatch(job).await?;
        Ok(guid)
    }

    /// Route a job: local tasks go to the worker pool, remote ones to their engine
    async fn dispatch(&self, mut job: PipelineJob) -> Result<(), PipelineJobError> {
        let next = match self.inner.runner.advance(&mut job).await {
            Ok(next) => next,
            Err(e) => {
                job.error(&e.to_string()).await;
                self.mark_error(job.guid, &e.to_string()).await;
                return Err(e);
            }
        };

        match next {
            NextTask::Run(factory) if !factory.is_local() => self.hand_off(job, factory).await,
            _ => {
                self.spawn_local(job).await;
                Ok(())
            }
        }
    }

    async fn spawn_local(&self, job: PipelineJob) {
        let guid = job.guid;
        self.inner
            .executing
            .lock()
            .await
            .insert(guid, job.cancellation_token());

        let service = self.clone();
        let handle = tokio::spawn(async move { service.run_local(job).await });

        let mut workers = self.inner.workers.lock().await;
        workers.retain(|_, worker| !worker.is_finished());
        workers.insert(guid, handle);
    }

    async fn run_local(&self, mut job: PipelineJob) -> Outcome {
        let _permit = match self.inner.slots.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.executing.lock().await.remove(&job.guid);
                return Outcome::Failed {
                    message: "worker pool is closed".to_string(),
                }
            }
        };

        let outcome = self.inner.runner.run(&mut job).await;
        self.inner.executing.lock().await.remove(&job.guid);

        if let Outcome::HandOff { task_id, .. } = &outcome {
            match self.inner.registry.factory(task_id) {
                Some(factory) => {
                    if let Err(e) = self.hand_off(job, factory).await {
                        warn!("Failed to hand off job: {}", e);
                    }
                }
                None => warn!("Task {} disappeared from the registry", task_id),
            }
        }
        outcome
    }

    /// Submit the job's active task to the engine for its location
    async fn hand_off(
        &self,
        mut job: PipelineJob,
        factory: Arc<dyn TaskFactory>,
    ) -> Result<(), PipelineJobError> {
        let guid = job.guid;
        let location = factory.location().to_string();
        let task_id = factory.id().clone();
        job.set_active_task(Some(task_id.clone()), TaskStatus::Waiting);

        // A job that has not started stays WAITING until the engine reports progress
        let current = self.inner.status.require(guid).await?;
        let status = if current.status == TaskStatus::Waiting {
            TaskStatus::Waiting
        } else {
            TaskStatus::Running
        };
        let update = StatusUpdate::new(status)
            .with_task(Some(task_id.clone()), Some(factory.status_name()))
            .with_location(location.clone())
            .with_completed_tasks(job.completed_tasks());
        self.inner.status.set_status(guid, update).await?;

        job.log.info(&format!("Submitting task {} to '{}'", task_id, location)).await;
        self.inner.remote.lock().await.insert(
            guid,
            RemoteJob {
                job: job.clone(),
                location: location.clone(),
            },
        );

        self.submit_remote(&job, &location).await?;
        self.inner
            .runner
            .emit_event(JobEvent::JobHandedOff {
                job_guid: guid,
                task_id,
                location,
            })
            .await;
        Ok(())
    }

    async fn submit_remote(&self, job: &PipelineJob, location: &str) -> Result<(), PipelineJobError> {
        let result = match self.inner.engines.get(location) {
            Some(engine) => engine.submit_job(job).await,
            None => Err(PipelineJobError::NoEngine(location.to_string())),
        };

        if let Err(e) = result {
            job.log.error(&e.to_string()).await;
            match self.inner.settings.on_submit_failure {
                SubmitFailurePolicy::Error => {
                    self.inner.remote.lock().await.remove(&job.guid);
                    self.mark_error(job.guid, &e.to_string()).await;
                }
                SubmitFailurePolicy::LeaveWaiting => {
                    warn!("Job {} left waiting after failed submission: {}", job.guid, e);
                }
            }
            return Err(e);
        }
        info!("Job {} submitted to '{}'", job.guid, location);
        Ok(())
    }

    /// Submit a held remote job to its engine again
    pub async fn resubmit(&self, job_guid: Uuid) -> Result<(), PipelineJobError> {
        let (job, location) = {
            let remote = self.inner.remote.lock().await;
            let held = remote
                .get(&job_guid)
                .ok_or(PipelineJobError::UnknownJob(job_guid))?;
            (held.job.clone(), held.location.clone())
        };
        self.submit_remote(&job, &location).await
    }

    async fn mark_error(&self, job_guid: Uuid, message: &str) {
        let update = StatusUpdate::new(TaskStatus::Error).with_info(message);
        if let Err(e) = self.inner.status.set_status(job_guid, update).await {
            warn!("Failed to mark job {} as failed: {}", job_guid, e);
        }
    }

    /// Request cancellation; returns the job's status afterwards
    ///
    /// Finished jobs are left as they are.
    pub async fn cancel(&self, job_guid: Uuid) -> Result<TaskStatus, PipelineJobError> {
        let record = self.status(job_guid).await?;
        if record.is_terminal() {
            debug!("Job {} already finished as {}", job_guid, record.status);
            return Ok(record.status);
        }

        let local_token = self.inner.executing.lock().await.get(&job_guid).cloned();

        let held_remote = self.inner.remote.lock().await.remove(&job_guid);
        if held_remote.is_some() || record.is_remote() {
            if let Some(held) = &held_remote {
                held.job.request_cancel();
            }
            if let Some(token) = &local_token {
                token.cancel();
            }
            match self.inner.engines.get(&record.location) {
                Some(engine) => {
                    if let Err(e) = engine.cancel_job(job_guid).await {
                        warn!("Engine '{}' failed to cancel job {}: {}", record.location, job_guid, e);
                    }
                }
                None => warn!("No engine for location '{}'", record.location),
            }
            return self.set_cancelled(job_guid, TaskStatus::Cancelled).await;
        }

        let status = match (record.status, &local_token) {
            (TaskStatus::Running, Some(_)) => TaskStatus::Cancelling,
            (TaskStatus::Cancelling, Some(_)) => return Ok(TaskStatus::Cancelling),
            _ => TaskStatus::Cancelled,
        };
        // The runner must see the token before it can trip over CANCELLING
        if let Some(token) = &local_token {
            token.cancel();
        }
        let status = self.set_cancelled(job_guid, status).await?;
        info!("Cancellation requested for job {} ({})", job_guid, status);
        Ok(status)
    }

    async fn set_cancelled(&self, job_guid: Uuid, status: TaskStatus) -> Result<TaskStatus, PipelineJobError> {
        let update = StatusUpdate::new(status).with_info("Cancelled");
        match self.inner.status.set_status(job_guid, update).await {
            Ok(_) => Ok(status),
            // The job finished first
            Err(StatusError::IllegalTransition { .. }) => Ok(self.status(job_guid).await?.status),
            Err(e) => Err(e.into()),
        }
    }

    /// Wait for the local execution of a job to finish, then return its record
    pub async fn wait(&self, job_guid: Uuid) -> Result<StatusRecord, PipelineJobError> {
        let worker = self.inner.workers.lock().await.remove(&job_guid);
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("Job {} worker panicked: {}", job_guid, e);
            }
        }
        self.status(job_guid).await
    }

    /// Current status record of a job
    pub async fn status(&self, job_guid: Uuid) -> Result<StatusRecord, PipelineJobError> {
        self.inner
            .status
            .get(job_guid)
            .await?
            .ok_or(PipelineJobError::UnknownJob(job_guid))
    }

    /// Status records, newest first
    pub async fn list(&self, container: Option<&str>) -> Result<Vec<StatusRecord>, PipelineJobError> {
        Ok(self.inner.status.list(container).await?)
    }

    /// Mark jobs left running by a previous process as failed
    pub async fn recover_interrupted(&self) -> Result<Vec<Uuid>, PipelineJobError> {
        Ok(self.inner.status.recover_interrupted().await?)
    }

    /// Poll remote engines and bring the status table up to date
    ///
    /// Returns the number of jobs whose status changed. Engine failures are
    /// logged and leave the previous status in place.
    pub async fn update_remote_statuses(&self) -> Result<usize, PipelineJobError> {
        let mut by_location: BTreeMap<String, Vec<Uuid>> = BTreeMap::new();
        for record in self.inner.status.active().await? {
            if record.is_remote() {
                by_location
                    .entry(record.location.clone())
                    .or_default()
                    .push(record.job_guid);
            }
        }

        let mut changed = 0;
        for (location, guids) in by_location {
            let Some(engine) = self.inner.engines.get(&location) else {
                warn!("No engine for location '{}' ({} job(s))", location, guids.len());
                continue;
            };
            let statuses = match engine.update_status_for_jobs(&guids).await {
                Ok(statuses) => statuses,
                Err(e) => {
                    warn!("Status poll of '{}' failed: {}", location, e);
                    continue;
                }
            };
            for remote in statuses {
                match self.apply_remote_status(&location, remote).await {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to reconcile job status from '{}': {}", location, e),
                }
            }
        }
        Ok(changed)
    }

    async fn apply_remote_status(
        &self,
        location: &str,
        remote: RemoteJobStatus,
    ) -> Result<bool, PipelineJobError> {
        let guid = remote.job_guid;
        let record = self.status(guid).await?;
        if record.is_terminal() || record.location != location {
            return Ok(false);
        }

        match remote.status {
            TaskStatus::Complete => {
                self.remote_task_complete(record, location).await?;
                Ok(true)
            }
            TaskStatus::Waiting => Ok(false),
            status if status == record.status && status == TaskStatus::Running => Ok(false),
            status => {
                let status_name = record
                    .active_task_id
                    .as_ref()
                    .and_then(|id| self.inner.registry.factory(id))
                    .map(|f| f.status_name());
                let mut update = StatusUpdate::new(status)
                    .with_task(record.active_task_id.clone(), status_name);
                if let Some(info) = remote.info {
                    update = update.with_info(info);
                }
                self.inner.status.set_status(guid, update).await?;
                if status.is_terminal() {
                    let held = self.inner.remote.lock().await.remove(&guid);
                    if let Some(held) = held {
                        let message = format!("Remote task finished as {}", status);
                        held.job.log.warn(&message).await;
                    }
                }
                debug!("Job {} now {} at '{}'", guid, status, location);
                Ok(true)
            }
        }
    }

    /// The remote task finished: record it and continue the job here
    async fn remote_task_complete(&self, record: StatusRecord, location: &str) -> Result<(), PipelineJobError> {
        let guid = record.job_guid;
        let held = self.inner.remote.lock().await.remove(&guid);

        let Some(RemoteJob { mut job, .. }) = held else {
            // Nothing to resume from; finish the job only if this was its last task
            let last = self
                .inner
                .registry
                .pipeline(&record.pipeline_id)
                .and_then(|p| p.progression().last().cloned());
            let update = if record.active_task_id.is_some() && record.active_task_id == last {
                StatusUpdate::new(TaskStatus::Complete)
                    .with_completed_tasks(record.completed_tasks + 1)
            } else {
                StatusUpdate::new(TaskStatus::Error)
                    .with_task(record.active_task_id.clone(), None)
                    .with_info("Remote task completed but the job is no longer held")
            };
            self.inner.status.set_status(guid, update).await?;
            return Ok(());
        };

        if let Some(task_id) = job.active_task_id().cloned() {
            let mut action = RecordedAction::new(task_id.clone(), task_id.name.clone());
            action.add_parameter("location", location);
            job.record_actions(RecordedActionSet::single(action.finish()));
            job.log.info(&format!("Task {} complete at '{}'", task_id, location)).await;
            self.inner
                .runner
                .emit_event(JobEvent::TaskCompleted {
                    job_guid: guid,
                    task_id,
                })
                .await;
        }
        job.mark_task_completed();
        job.set_active_status(TaskStatus::Complete);

        self.dispatch(job).await
    }

    /// Reconcile remote statuses every `interval` until `token` is cancelled
    pub fn spawn_reconciler(&self, interval: Duration, token: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                match service.update_remote_statuses().await {
                    Ok(0) => {}
                    Ok(changed) => debug!("Reconciled {} remote job(s)", changed),
                    Err(e) => warn!("Remote status reconciliation failed: {}", e),
                }
            }
            debug!("Reconciler stopped");
        })
    }

    /// Number of jobs currently held by remote engines
    pub async fn remote_job_count(&self) -> usize {
        self.inner.remote.lock().await.len()
    }
}

#[async_trait]
impl JobSubmitter for JobService {
    async fn submit_request(&self, request: JobRequest) -> Result<Uuid, PipelineJobError> {
        let job = self.create_job(request).await?;
        self.submit(job).await
    }

    fn pipe_root(&self, container: &str) -> Option<PipeRoot> {
        self.inner.roots.get(container).cloned()
    }
}
