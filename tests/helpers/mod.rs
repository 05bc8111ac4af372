//! Test utilities for the job kernel

#![allow(dead_code)]

use async_trait::async_trait;
use pipejob::core::config::{Settings, SubmitFailurePolicy};
use pipejob::core::{
    JobRequest, PipeRootRegistry, PipelineJob, RecordedAction, RecordedActionSet, StatusRecord,
    Task, TaskContext, TaskFactory, TaskId, TaskPipeline, TaskStatus, LOCAL_LOCATION,
};
use pipejob::error::TaskError;
use pipejob::execution::{JobService, TaskRegistry};
use pipejob::persistence::{InMemoryStore, StatusManager};
use pipejob::remote::{DummyRemoteExecutionEngine, EngineRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

/// Location of the test engine
pub const CLUSTER: &str = "cluster";

/// Container every test job runs in
pub const CONTAINER: &str = "home";

/// What a scripted task does when it runs
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Mode {
    /// Record one action and succeed
    Succeed,
    /// Return an error
    Fail,
    /// Log an error through the context but return normally
    LogError,
    /// Block until the job is cancelled
    WaitForCancel,
    /// Report the job's work for this task as already done
    AlreadyDone,
    /// Succeed once the harness releases the gate
    Gated,
}

/// Factory for scripted tasks that counts how often its tasks ran
pub struct ScriptedFactory {
    id: TaskId,
    mode: Mode,
    location: String,
    runs: Arc<AtomicUsize>,
    gate: Arc<Notify>,
}

impl ScriptedFactory {
    pub fn new(name: &str, mode: Mode, location: &str) -> Self {
        Self {
            id: TaskId::task(name),
            mode,
            location: location.to_string(),
            runs: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new(Notify::new()),
        }
    }

    fn with_gate(mut self, gate: Arc<Notify>) -> Self {
        self.gate = gate;
        self
    }
}

struct ScriptedTask {
    id: TaskId,
    mode: Mode,
    runs: Arc<AtomicUsize>,
    gate: Arc<Notify>,
}

#[async_trait]
impl Task for ScriptedTask {
    async fn run(&mut self, ctx: &TaskContext) -> Result<RecordedActionSet, TaskError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            Mode::Fail => Err(TaskError::failed(format!("{} exploded", self.id.name))),
            Mode::LogError => {
                ctx.error("bad input").await;
                Ok(RecordedActionSet::new())
            }
            Mode::WaitForCancel => {
                ctx.cancelled().await;
                Err(TaskError::Cancelled)
            }
            Mode::Gated => {
                self.gate.notified().await;
                Ok(RecordedActionSet::single(
                    RecordedAction::new(self.id.clone(), "scripted").finish(),
                ))
            }
            Mode::Succeed | Mode::AlreadyDone => {
                ctx.info(&format!("{} did its work", self.id.name)).await;
                Ok(RecordedActionSet::single(
                    RecordedAction::new(self.id.clone(), "scripted").finish(),
                ))
            }
        }
    }
}

impl TaskFactory for ScriptedFactory {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn create_task(&self, _job: &PipelineJob) -> Box<dyn Task> {
        Box::new(ScriptedTask {
            id: self.id.clone(),
            mode: self.mode,
            runs: self.runs.clone(),
            gate: self.gate.clone(),
        })
    }

    fn is_job_complete(&self, _job: &PipelineJob) -> bool {
        self.mode == Mode::AlreadyDone
    }
}

/// A job service wired to in-memory stores and a dummy cluster engine
pub struct Harness {
    pub service: JobService,
    pub engine: Arc<DummyRemoteExecutionEngine>,
    pub status: Arc<StatusManager>,
    pub dir: tempfile::TempDir,
    runs: HashMap<String, Arc<AtomicUsize>>,
    gate: Arc<Notify>,
}

impl Harness {
    /// Build a service running pipeline `p` over the given tasks
    pub fn new(tasks: &[(&str, Mode, &str)]) -> Self {
        Self::with_policy(tasks, SubmitFailurePolicy::Error)
    }

    pub fn with_policy(tasks: &[(&str, Mode, &str)], policy: SubmitFailurePolicy) -> Self {
        let mut registry = TaskRegistry::new();
        let mut runs = HashMap::new();
        let gate = Arc::new(Notify::new());
        for (name, mode, location) in tasks {
            let factory = ScriptedFactory::new(name, *mode, location).with_gate(gate.clone());
            runs.insert(name.to_string(), factory.runs.clone());
            registry.register_factory(Arc::new(factory)).unwrap();
        }
        let progression = tasks.iter().map(|(name, _, _)| TaskId::task(*name)).collect();
        registry
            .register_pipeline(TaskPipeline::new(TaskId::pipeline("p"), "test pipeline", progression).unwrap())
            .unwrap();

        let engine = Arc::new(DummyRemoteExecutionEngine::new(CLUSTER));
        let mut engines = EngineRegistry::new();
        engines.register(engine.clone()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut roots = HashMap::new();
        roots.insert(CONTAINER.to_string(), dir.path().display().to_string());

        let status = Arc::new(StatusManager::new(Arc::new(InMemoryStore::new())));
        let settings = Settings {
            on_submit_failure: policy,
            ..Settings::default()
        };
        let service = JobService::new(
            Arc::new(registry),
            status.clone(),
            Arc::new(engines),
            PipeRootRegistry::from_map(&roots),
            settings,
        );

        Self {
            service,
            engine,
            status,
            dir,
            runs,
            gate,
        }
    }

    /// Let a waiting gated task finish
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn request(&self) -> JobRequest {
        JobRequest::new(TaskId::pipeline("p"), CONTAINER, "tester")
    }

    /// Create and submit a job of pipeline `p`
    pub async fn submit(&self) -> Uuid {
        let job = self.service.create_job(self.request()).await.unwrap();
        self.service.submit(job).await.unwrap()
    }

    /// Number of times the named task ran
    pub fn runs(&self, task: &str) -> usize {
        self.runs
            .get(task)
            .map_or(0, |runs| runs.load(Ordering::SeqCst))
    }

    /// Poll until the job reaches `status`, failing after a few seconds
    pub async fn wait_for(&self, guid: Uuid, status: TaskStatus) -> StatusRecord {
        for _ in 0..500 {
            let record = self.service.status(guid).await.unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", guid, status);
    }
}

/// Contents of a job's log file
pub fn read_log(record: &StatusRecord) -> String {
    std::fs::read_to_string(&record.log_path).unwrap_or_default()
}

pub const LOCAL: &str = LOCAL_LOCATION;
