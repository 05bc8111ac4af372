//! Local job execution: ordering, failure, cancellation and recovery

mod helpers;

use helpers::*;
use pipejob::core::config::PipelineConfig;
use pipejob::core::{JobRequest, PipeRootRegistry, StatusUpdate, TaskId, TaskStatus};
use pipejob::error::StatusError;
use pipejob::execution::{JobEvent, JobService, TaskRegistry};
use pipejob::persistence::status_manager::INTERRUPTED_INFO;
use pipejob::persistence::{InMemoryStore, StatusManager};
use pipejob::remote::EngineRegistry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[tokio::test]
async fn test_tasks_run_in_order_to_completion() {
    let harness = Harness::new(&[
        ("extract", Mode::Succeed, LOCAL),
        ("convert", Mode::Succeed, LOCAL),
        ("index", Mode::Succeed, LOCAL),
    ]);

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = events.clone();
    harness
        .service
        .add_event_handler(move |event| {
            if let JobEvent::TaskStarted { task_id, .. } = event {
                seen.lock().unwrap().push(task_id.name);
            }
        })
        .await;

    let guid = harness.submit().await;
    let record = harness.service.wait(guid).await.unwrap();

    assert_eq!(record.status, TaskStatus::Complete);
    assert_eq!(record.completed_tasks, 3);
    assert_eq!(record.location, LOCAL);
    assert_eq!(
        *events.lock().unwrap(),
        vec!["extract".to_string(), "convert".to_string(), "index".to_string()]
    );
}

#[tokio::test]
async fn test_first_failure_halts_the_job() {
    let harness = Harness::new(&[
        ("extract", Mode::Succeed, LOCAL),
        ("convert", Mode::Fail, LOCAL),
        ("index", Mode::Succeed, LOCAL),
    ]);

    let guid = harness.submit().await;
    let record = harness.service.wait(guid).await.unwrap();

    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.completed_tasks, 1);
    assert_eq!(record.active_task_id, Some(TaskId::task("convert")));
    assert_eq!(harness.runs("extract"), 1);
    assert_eq!(harness.runs("convert"), 1);
    assert_eq!(harness.runs("index"), 0);
    assert!(record.info.unwrap_or_default().contains("convert exploded"));
}

#[tokio::test]
async fn test_failure_message_is_written_to_job_log() {
    let harness = Harness::new(&[("convert", Mode::Fail, LOCAL)]);

    let guid = harness.submit().await;
    let record = harness.service.wait(guid).await.unwrap();

    assert_eq!(record.status, TaskStatus::Error);
    assert!(record.log_path.starts_with(&harness.dir.path().display().to_string()));
    let log = read_log(&record);
    assert!(log.contains("ERROR"));
    assert!(log.contains("convert exploded"));
}

#[tokio::test]
async fn test_logged_errors_fail_the_task() {
    let harness = Harness::new(&[
        ("convert", Mode::LogError, LOCAL),
        ("index", Mode::Succeed, LOCAL),
    ]);

    let guid = harness.submit().await;
    let record = harness.service.wait(guid).await.unwrap();

    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(harness.runs("index"), 0);
    assert!(read_log(&record).contains("bad input"));
}

#[tokio::test]
async fn test_completed_tasks_are_skipped() {
    let harness = Harness::new(&[
        ("extract", Mode::AlreadyDone, LOCAL),
        ("convert", Mode::Succeed, LOCAL),
    ]);

    let guid = harness.submit().await;
    let record = harness.service.wait(guid).await.unwrap();

    assert_eq!(record.status, TaskStatus::Complete);
    assert_eq!(harness.runs("extract"), 0);
    assert_eq!(harness.runs("convert"), 1);
    assert!(read_log(&record).contains("Skipping task task:extract: already complete"));
}

#[tokio::test]
async fn test_cancel_running_job() {
    let harness = Harness::new(&[
        ("convert", Mode::WaitForCancel, LOCAL),
        ("index", Mode::Succeed, LOCAL),
    ]);

    let guid = harness.submit().await;
    harness.wait_for(guid, TaskStatus::Running).await;

    let status = harness.service.cancel(guid).await.unwrap();
    assert!(matches!(
        status,
        TaskStatus::Cancelling | TaskStatus::Cancelled
    ));

    let record = harness.service.wait(guid).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(harness.runs("index"), 0);
}

#[tokio::test]
async fn test_cancel_written_to_status_table_stops_job() {
    let harness = Harness::new(&[
        ("convert", Mode::Gated, LOCAL),
        ("index", Mode::Succeed, LOCAL),
    ]);

    let guid = harness.submit().await;
    harness.wait_for(guid, TaskStatus::Running).await;

    // What the cancel command does from another process
    harness
        .status
        .set_status(
            guid,
            StatusUpdate::new(TaskStatus::Cancelling).with_info("Cancelled"),
        )
        .await
        .unwrap();
    harness.release();

    let record = harness.service.wait(guid).await.unwrap();
    assert_eq!(record.status, TaskStatus::Cancelled);
    assert_eq!(record.active_task_id, Some(TaskId::task("convert")));
    assert_eq!(harness.runs("convert"), 1);
    assert_eq!(harness.runs("index"), 0);
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let harness = Harness::new(&[("convert", Mode::Succeed, LOCAL)]);

    let guid = harness.submit().await;
    harness.service.wait(guid).await.unwrap();

    let status = harness.service.cancel(guid).await.unwrap();
    assert_eq!(status, TaskStatus::Complete);
    assert_eq!(
        harness.service.status(guid).await.unwrap().status,
        TaskStatus::Complete
    );
}

#[tokio::test]
async fn test_finished_job_cannot_run_again() {
    let harness = Harness::new(&[("convert", Mode::Succeed, LOCAL)]);

    let guid = harness.submit().await;
    harness.service.wait(guid).await.unwrap();

    let result = harness
        .status
        .set_status(guid, StatusUpdate::new(TaskStatus::Running))
        .await;
    assert!(matches!(
        result,
        Err(StatusError::IllegalTransition {
            from: TaskStatus::Complete,
            to: TaskStatus::Running,
            ..
        })
    ));
}

#[tokio::test]
async fn test_recover_interrupted_local_jobs() {
    let harness = Harness::new(&[("convert", Mode::Succeed, LOCAL)]);

    // A record left RUNNING by a process that went away
    let job = harness.service.create_job(harness.request()).await.unwrap();
    let guid = job.guid;
    harness
        .status
        .set_status(
            guid,
            StatusUpdate::new(TaskStatus::Running)
                .with_task(Some(TaskId::task("convert")), Some("CONVERT".to_string())),
        )
        .await
        .unwrap();

    let recovered = harness.service.recover_interrupted().await.unwrap();
    assert_eq!(recovered, vec![guid]);

    let record = harness.service.status(guid).await.unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.info.as_deref(), Some(INTERRUPTED_INFO));
}

#[tokio::test]
async fn test_unknown_pipeline_is_rejected() {
    let harness = Harness::new(&[("convert", Mode::Succeed, LOCAL)]);

    let request = JobRequest::new(TaskId::pipeline("missing"), CONTAINER, "tester");
    assert!(harness.service.create_job(request).await.is_err());
    assert!(harness.service.list(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_command_tasks_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!(
        r#"
roots:
  home: "{}"

tasks:
  - id: "greet"
    command: "echo"
    args: ["hello", "${{name}}"]
  - id: "broken"
    command: "sh"
    args: ["-c", "exit 3"]

pipelines:
  - id: "hello"
    tasks: ["greet"]
  - id: "broken"
    tasks: ["greet", "broken"]
"#,
        dir.path().display()
    );
    let config = PipelineConfig::from_yaml(&yaml).unwrap();

    let service = JobService::new(
        Arc::new(TaskRegistry::from_config(&config).unwrap()),
        Arc::new(StatusManager::new(Arc::new(InMemoryStore::new()))),
        Arc::new(EngineRegistry::new()),
        PipeRootRegistry::from_map(&config.roots),
        config.settings.clone(),
    );

    let request = JobRequest::new(TaskId::pipeline("hello"), "home", "tester")
        .with_parameter("name", "world");
    let job = service.create_job(request).await.unwrap();
    let guid = service.submit(job).await.unwrap();
    let record = service.wait(guid).await.unwrap();
    assert_eq!(record.status, TaskStatus::Complete);
    assert!(read_log(&record).contains("hello world"));

    let job = service
        .create_job(JobRequest::new(TaskId::pipeline("broken"), "home", "tester"))
        .await
        .unwrap();
    let guid = service.submit(job).await.unwrap();
    let record = service.wait(guid).await.unwrap();
    assert_eq!(record.status, TaskStatus::Error);
    assert_eq!(record.completed_tasks, 1);
    assert!(read_log(&record).contains("exited with code 3"));

    let mut by_status: HashMap<TaskStatus, usize> = HashMap::new();
    for record in service.list(Some("home")).await.unwrap() {
        *by_status.entry(record.status).or_default() += 1;
    }
    assert_eq!(by_status.get(&TaskStatus::Complete), Some(&1));
    assert_eq!(by_status.get(&TaskStatus::Error), Some(&1));
}
