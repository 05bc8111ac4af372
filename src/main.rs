use anyhow::{Context, Result};
use pipejob::cli::commands::{
    CancelCommand, RunCommand, StatusCommand, TriggersCommand, ValidateCommand, WatchCommand,
};
use pipejob::cli::output::*;
use pipejob::cli::{Cli, Command};
use pipejob::core::config::{PipelineConfig, Settings};
use pipejob::core::{JobRequest, PipeRootRegistry, TaskId, TaskIdKind};
use pipejob::execution::{JobEvent, JobService, TaskRegistry};
use pipejob::persistence::{InMemoryStore, StatusManager, StatusStore, TriggerConfigStore};
use pipejob::remote::EngineRegistry;
use pipejob::trigger::{
    FileWatchTriggerType, PipelineTriggerConfig, PipelineTriggerRegistry, ScheduleTriggerType,
};
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_job(cmd).await?,
        Command::Status(cmd) => show_status(cmd).await?,
        Command::Cancel(cmd) => cancel_job(cmd).await?,
        Command::Triggers(cmd) => list_triggers(cmd).await?,
        Command::Watch(cmd) => watch(cmd).await?,
        Command::Validate(cmd) => validate_config(cmd)?,
    }

    Ok(())
}

/// Status and trigger stores
struct Stores {
    status: Arc<dyn StatusStore>,
    triggers: Arc<dyn TriggerConfigStore>,
}

#[cfg(feature = "sqlite")]
async fn open_stores(settings: &Settings, ephemeral: bool) -> Result<Stores> {
    if ephemeral {
        let store = Arc::new(InMemoryStore::new());
        return Ok(Stores {
            status: store.clone(),
            triggers: store,
        });
    }
    let path = settings.database_path();
    let store = Arc::new(
        pipejob::persistence::SqliteStore::open(&path)
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?,
    );
    Ok(Stores {
        status: store.clone(),
        triggers: store,
    })
}

#[cfg(not(feature = "sqlite"))]
async fn open_stores(_settings: &Settings, ephemeral: bool) -> Result<Stores> {
    if !ephemeral {
        warn!("Built without SQLite support; job status is kept in memory");
    }
    let store = Arc::new(InMemoryStore::new());
    Ok(Stores {
        status: store.clone(),
        triggers: store,
    })
}

/// Everything needed to run jobs for one configuration
struct Kernel {
    config: PipelineConfig,
    stores: Stores,
    service: JobService,
}

async fn build_kernel(config: PipelineConfig, ephemeral: bool) -> Result<Kernel> {
    let stores = open_stores(&config.settings, ephemeral).await?;
    let registry = Arc::new(TaskRegistry::from_config(&config)?);
    let engines = Arc::new(EngineRegistry::from_configs(&config.engines)?);
    let status = Arc::new(StatusManager::new(stores.status.clone()));

    let service = JobService::new(
        registry,
        status,
        engines,
        PipeRootRegistry::from_map(&config.roots),
        config.settings.clone(),
    );

    Ok(Kernel {
        config,
        stores,
        service,
    })
}

async fn build_triggers(kernel: &Kernel) -> Result<PipelineTriggerRegistry> {
    let triggers = PipelineTriggerRegistry::new(kernel.stores.triggers.clone());
    let submitter = Arc::new(kernel.service.clone());
    triggers
        .register(Arc::new(
            FileWatchTriggerType::new(submitter.clone()).with_store(kernel.stores.triggers.clone()),
        ))
        .await?;
    triggers
        .register(Arc::new(
            ScheduleTriggerType::new(submitter).with_store(kernel.stores.triggers.clone()),
        ))
        .await?;
    Ok(triggers)
}

fn load_config(file: &str) -> Result<PipelineConfig> {
    PipelineConfig::from_file(file).with_context(|| format!("Failed to load configuration {}", file))
}

/// Settings from an optional configuration file
fn load_settings(file: Option<&String>) -> Result<Settings> {
    match file {
        Some(file) => Ok(load_config(file)?.settings),
        None => Ok(Settings::default()),
    }
}

async fn run_job(cmd: &RunCommand) -> Result<()> {
    let config = load_config(&cmd.file)?;
    let kernel = build_kernel(config, cmd.no_history).await?;
    let service = &kernel.service;

    let pipeline_id = TaskId::parse_with_default(&cmd.pipeline, TaskIdKind::Pipeline)
        .map_err(anyhow::Error::msg)?;
    let mut request = JobRequest::new(pipeline_id, cmd.container.clone(), cmd.user.clone());
    for (key, value) in &cmd.param {
        request = request.with_parameter(key.clone(), value.clone());
        println!(
            "{} Parameter: {} = {}",
            INFO,
            style(key).cyan(),
            style(value).dim()
        );
    }

    let job = service.create_job(request).await?;
    let guid = job.guid;
    let log_path = job.log_path().to_path_buf();

    // Set up event handler for console output
    let progress = create_progress_bar(job.pipeline().len());
    let bar = progress.clone();
    service
        .add_event_handler(move |event| {
            bar.println(format_job_event(&event));
            if matches!(
                event,
                JobEvent::TaskCompleted { .. } | JobEvent::TaskSkipped { .. }
            ) {
                bar.inc(1);
            }
        })
        .await;

    service.submit(job).await?;

    // Remote tasks are polled on the reconcile interval, local status more often
    let mut reconcile = tokio::time::interval(Duration::from_secs(
        kernel.config.settings.reconcile_interval_secs.max(1),
    ));
    reconcile.tick().await;
    let record = loop {
        tokio::select! {
            record = service.wait(guid) => {
                let record = record?;
                if record.is_terminal() {
                    break record;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                progress.println(format!("{} Cancelling job...", WARN));
                service.cancel(guid).await?;
            }
        }
        tokio::select! {
            _ = reconcile.tick() => {
                service.update_remote_statuses().await?;
            }
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    };
    progress.finish_and_clear();

    println!("\n{}", format_record(&record));
    println!("  Log: {}", style(log_path.display()).dim());
    if !cmd.no_history {
        println!(
            "{} Job saved to history (ID: {})",
            INFO,
            style(record.job_guid).dim()
        );
    }

    if record.status != pipejob::core::TaskStatus::Complete {
        error!("Job {} ended as {}", record.job_guid, record.status);
        std::process::exit(1);
    }
    Ok(())
}

async fn show_status(cmd: &StatusCommand) -> Result<()> {
    let settings = load_settings(cmd.file.as_ref())?;
    let stores = open_stores(&settings, false).await?;
    let status = StatusManager::new(stores.status);

    let records = match &cmd.job {
        Some(job) => {
            let guid = uuid::Uuid::parse_str(job).context("Invalid job GUID")?;
            match status.get(guid).await? {
                Some(record) => vec![record],
                None => {
                    println!("{} Job not found", WARN);
                    return Ok(());
                }
            }
        }
        None => status
            .list(cmd.container.as_deref())
            .await?
            .into_iter()
            .take(cmd.limit)
            .collect(),
    };

    if cmd.json {
        let data = serde_json::json!({ "jobs": records });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("{} No jobs found", INFO);
        return Ok(());
    }
    for record in &records {
        println!("  {}", format_record(record));
    }
    Ok(())
}

async fn cancel_job(cmd: &CancelCommand) -> Result<()> {
    let settings = load_settings(cmd.file.as_ref())?;
    let stores = open_stores(&settings, false).await?;
    let status = StatusManager::new(stores.status);
    let guid = uuid::Uuid::parse_str(&cmd.job).context("Invalid job GUID")?;

    let record = match status.get(guid).await? {
        Some(record) => record,
        None => {
            println!("{} Job not found", WARN);
            return Ok(());
        }
    };
    if record.is_terminal() {
        println!("{} Job already finished: {}", INFO, format_status(record.status));
        return Ok(());
    }

    // The process running the job checks the status table between tasks
    let target = if record.status == pipejob::core::TaskStatus::Running && !record.is_remote() {
        pipejob::core::TaskStatus::Cancelling
    } else {
        pipejob::core::TaskStatus::Cancelled
    };
    let update = pipejob::core::StatusUpdate::new(target).with_info("Cancelled");
    status.set_status(guid, update).await?;
    println!("{} Job {}: {}", CHECK, style(guid).dim(), format_status(target));
    Ok(())
}

async fn list_triggers(cmd: &TriggersCommand) -> Result<()> {
    let config = load_config(&cmd.file)?;
    let stores = open_stores(&config.settings, false).await?;

    // Stored configurations, plus definitions `watch` has not saved yet
    let mut configs = stores
        .triggers
        .find_triggers(cmd.container.as_deref(), None, None)
        .await?;
    for def in &config.triggers {
        if cmd.container.as_deref().map_or(false, |c| c != def.container) {
            continue;
        }
        let stored = configs
            .iter()
            .any(|c| c.container == def.container && c.name == def.name);
        if !stored {
            configs.push(PipelineTriggerConfig::from_definition(def)?);
        }
    }

    if cmd.json {
        let data = serde_json::json!({ "triggers": configs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if configs.is_empty() {
        println!("{} No triggers configured", INFO);
        return Ok(());
    }
    for config in &configs {
        println!("  {}", format_trigger(config));
    }
    Ok(())
}

async fn watch(cmd: &WatchCommand) -> Result<()> {
    let config = load_config(&cmd.file)?;
    let kernel = build_kernel(config, false).await?;

    let recovered = kernel.service.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!("Marked {} interrupted job(s) as failed", recovered.len());
    }

    kernel
        .service
        .add_event_handler(|event| println!("{}", format_job_event(&event)))
        .await;

    let triggers = build_triggers(&kernel).await?;
    triggers.load_definitions(&kernel.config.triggers).await?;
    let started = triggers.start_all().await?;

    let token = CancellationToken::new();
    let interval = Duration::from_secs(kernel.config.settings.reconcile_interval_secs.max(1));
    let reconciler = kernel.service.spawn_reconciler(interval, token.clone());

    println!(
        "{} Watching with {} trigger(s); press Ctrl-C to stop",
        ROCKET,
        style(started).cyan()
    );
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("{} Stopping...", INFO);
    triggers.stop_all().await?;
    token.cancel();
    if let Err(e) = reconciler.await {
        error!("Reconciler task failed: {}", e);
    }
    Ok(())
}

fn validate_config(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating configuration...", INFO);

    match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Configuration is valid!", CHECK);
            println!("  Tasks: {}", style(config.tasks.len()).cyan());
            println!("  Pipelines: {}", style(config.pipelines.len()).cyan());
            println!("  Triggers: {}", style(config.triggers.len()).cyan());
            println!("  Engines: {}", style(config.engines.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    }
}
