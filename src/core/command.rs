//! Command tasks defined in configuration

use crate::core::{
    config::TaskDefinition, PipelineJob, RecordedAction, RecordedActionSet, Task, TaskContext,
    TaskFactory, TaskId, LOCAL_LOCATION,
};
use crate::error::TaskError;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::fs;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

/// Default command timeout (one hour)
const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// Factory for tasks that run an external program
#[derive(Debug, Clone)]
pub struct CommandTaskFactory {
    id: TaskId,
    status_name: Option<String>,
    location: String,
    command: String,
    args: Vec<String>,
    outputs: Vec<String>,
    timeout_secs: u64,
}

impl CommandTaskFactory {
    pub fn from_definition(def: &TaskDefinition) -> Result<Self> {
        Ok(Self {
            id: def.task_id()?,
            status_name: def.status_name.clone(),
            location: def
                .location
                .clone()
                .unwrap_or_else(|| LOCAL_LOCATION.to_string()),
            command: def.command.clone(),
            args: def.args.clone(),
            outputs: def.outputs.clone(),
            timeout_secs: def.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS),
        })
    }
}

impl TaskFactory for CommandTaskFactory {
    fn id(&self) -> &TaskId {
        &self.id
    }

    fn status_name(&self) -> String {
        match &self.status_name {
            Some(name) => name.to_uppercase(),
            None => self.id.name.to_uppercase(),
        }
    }

    fn location(&self) -> &str {
        &self.location
    }

    fn create_task(&self, _job: &PipelineJob) -> Box<dyn Task> {
        Box::new(CommandTask {
            factory: self.clone(),
        })
    }

    fn is_job_complete(&self, job: &PipelineJob) -> bool {
        !self.outputs.is_empty()
            && self.outputs.iter().all(|output| {
                let resolved = substitute(output, &job.parameters);
                job.pipe_root.resolve(resolved).exists()
            })
    }
}

/// Replace `${name}` placeholders with job parameters
pub fn substitute(template: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in parameters {
        result = result.replace(&format!("${{{}}}", key), value);
    }
    result
}

struct CommandTask {
    factory: CommandTaskFactory,
}

#[async_trait]
impl Task for CommandTask {
    async fn run(&mut self, ctx: &TaskContext) -> Result<RecordedActionSet, TaskError> {
        let mut parameters = ctx.parameters.clone();
        parameters.insert("pipeRoot".to_string(), ctx.pipe_root.path.display().to_string());
        parameters.insert("jobGuid".to_string(), ctx.job_guid.to_string());

        let args: Vec<String> = self
            .factory
            .args
            .iter()
            .map(|a| substitute(a, &parameters))
            .collect();
        let command_line = format!("{} {}", self.factory.command, args.join(" "));

        let mut action = RecordedAction::new(self.factory.id.clone(), self.factory.id.name.clone());
        action.add_parameter("command", command_line.trim());
        if let Some(file) = ctx.parameters.get("file") {
            action.add_input(file);
        }

        ctx.info(&format!("Running: {}", command_line.trim())).await;
        debug!("Spawning command for task {}: {}", self.factory.id, command_line.trim());

        if !fs::try_exists(&ctx.pipe_root.path).await.unwrap_or(false) {
            fs::create_dir_all(&ctx.pipe_root.path).await?;
        }

        let child = Command::new(&self.factory.command)
            .args(&args)
            .current_dir(&ctx.pipe_root.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaskError::failed(format!("Failed to start '{}': {}", self.factory.command, e))
            })?;

        let timeout_duration = Duration::from_secs(self.factory.timeout_secs);
        let output = tokio::select! {
            result = timeout(timeout_duration, child.wait_with_output()) => {
                result.map_err(|_| TaskError::Timeout(self.factory.timeout_secs))??
            }
            _ = ctx.cancelled() => {
                // Dropping the child future kills the process
                ctx.warn("Command cancelled").await;
                return Err(TaskError::Cancelled);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            ctx.info(stdout.trim_end()).await;
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            ctx.warn(stderr.trim_end()).await;
        }

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            warn!("Task {} exited with code {}", self.factory.id, exit_code);
            return Err(TaskError::failed(format!(
                "'{}' exited with code {}",
                self.factory.command, exit_code
            )));
        }

        for out in &self.factory.outputs {
            action.add_output(ctx.pipe_root.resolve(substitute(out, &parameters)));
        }

        Ok(RecordedActionSet::single(action.finish()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(outputs: Vec<&str>) -> TaskDefinition {
        TaskDefinition {
            id: "convert".to_string(),
            status_name: Some("Converting".to_string()),
            location: None,
            command: "echo".to_string(),
            args: vec!["${file}".to_string()],
            outputs: outputs.into_iter().map(String::from).collect(),
            timeout_secs: Some(5),
        }
    }

    #[test]
    fn test_substitute() {
        let mut params = BTreeMap::new();
        params.insert("file".to_string(), "a.raw".to_string());
        assert_eq!(substitute("--in=${file} ${other}", &params), "--in=a.raw ${other}");
    }

    #[test]
    fn test_factory_from_definition() {
        let factory = CommandTaskFactory::from_definition(&definition(vec![])).unwrap();
        assert_eq!(factory.id(), &TaskId::task("convert"));
        assert_eq!(factory.status_name(), "CONVERTING");
        assert!(factory.is_local());
        assert_eq!(factory.timeout_secs, 5);
    }
}
