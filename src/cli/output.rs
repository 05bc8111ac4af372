//! CLI output formatting

use crate::core::{StatusRecord, TaskStatus};
use crate::execution::JobEvent;
use crate::trigger::PipelineTriggerConfig;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Create a progress bar for a job's tasks
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let bar_style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(bar_style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

fn short_guid(guid: &uuid::Uuid) -> String {
    guid.to_string()[..8].to_string()
}

/// Format a status for display
pub fn format_status(status: TaskStatus) -> String {
    match status {
        TaskStatus::Waiting => style("WAITING").dim().to_string(),
        TaskStatus::Running => style("RUNNING").yellow().to_string(),
        TaskStatus::Complete => style("COMPLETE").green().to_string(),
        TaskStatus::Error => style("ERROR").red().to_string(),
        TaskStatus::Cancelling => style("CANCELLING").yellow().to_string(),
        TaskStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a status record as one line
pub fn format_record(record: &StatusRecord) -> String {
    let status_icon = match record.status {
        TaskStatus::Complete => CHECK,
        TaskStatus::Error => CROSS,
        TaskStatus::Running | TaskStatus::Waiting => SPINNER,
        _ => WARN,
    };

    let mut line = format!(
        "{} {} - {} - {} - {} [{}] ({} task(s) done)",
        status_icon,
        style(short_guid(&record.job_guid)).dim(),
        style(&record.description).bold(),
        style(&record.container).cyan(),
        format_status(record.status),
        record.status_text,
        record.completed_tasks
    );
    if let Some(info) = &record.info {
        line.push_str(&format!(" - {}", style(info).dim()));
    }
    line
}

/// Format a job event for display
pub fn format_job_event(event: &JobEvent) -> String {
    match event {
        JobEvent::JobSubmitted {
            job_guid,
            pipeline_id,
        } => format!(
            "{} Starting job {} ({})",
            ROCKET,
            style(pipeline_id).bold(),
            style(short_guid(job_guid)).dim()
        ),
        JobEvent::TaskStarted { task_id, .. } => format!("{} {}", SPINNER, style(task_id).cyan()),
        JobEvent::TaskSkipped { task_id, .. } => {
            format!("{} {} (already complete)", INFO, style(task_id).dim())
        }
        JobEvent::TaskCompleted { task_id, .. } => format!("{} {}", CHECK, style(task_id).green()),
        JobEvent::TaskFailed { task_id, error, .. } => {
            format!("{} {}: {}", CROSS, style(task_id).red(), style(error).dim())
        }
        JobEvent::JobHandedOff {
            task_id, location, ..
        } => format!(
            "{} {} → {}",
            INFO,
            style(task_id).dim(),
            style(location).cyan()
        ),
        JobEvent::JobFinished { job_guid, status } => format!(
            "{} Job ({}) {}",
            INFO,
            style(short_guid(job_guid)).dim(),
            format_status(*status)
        ),
    }
}

/// Format a trigger configuration as one line
pub fn format_trigger(config: &PipelineTriggerConfig) -> String {
    let state = if config.enabled {
        style("enabled").green().to_string()
    } else {
        style("disabled").dim().to_string()
    };
    let last_checked = config
        .last_checked
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{} {} / {} - {} → {} ({}, last checked {})",
        INFO,
        style(&config.container).cyan(),
        style(&config.name).bold(),
        config.type_name,
        config.pipeline_id,
        state,
        last_checked
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::TaskId;

    #[test]
    fn test_format_job_event_mentions_task() {
        let event = JobEvent::TaskFailed {
            job_guid: uuid::Uuid::new_v4(),
            task_id: TaskId::task("convert"),
            error: "boom".to_string(),
        };
        let line = format_job_event(&event);
        assert!(line.contains("task:convert"));
        assert!(line.contains("boom"));
    }

    #[test]
    fn test_format_trigger_never_checked() {
        let config = PipelineTriggerConfig::new(
            "home",
            "incoming",
            "file-watch",
            TaskId::pipeline("p"),
            serde_json::json!({}),
        );
        assert!(format_trigger(&config).contains("never"));
    }
}
