//! File-watch trigger: submits a job for each new file in a directory

use crate::error::TriggerError;
use crate::persistence::TriggerConfigStore;
use crate::trigger::{
    touch_last_checked, JobSubmitter, PipelineTriggerConfig, PipelineTriggerType, Watchers,
};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Type name used in trigger configurations
pub const FILE_WATCH_TYPE: &str = "file-watch";

/// Configuration of a file-watch trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileWatchConfig {
    /// Directory to watch, relative to the container's pipe root or absolute
    pub location: String,

    /// Regex the file name must match in full
    #[serde(default = "default_file_pattern")]
    pub file_pattern: String,

    /// Also watch subdirectories
    #[serde(default)]
    pub recursive: bool,

    /// Submit jobs for files present when the trigger starts
    #[serde(default)]
    pub include_existing: bool,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_file_pattern() -> String {
    ".*".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

impl FileWatchConfig {
    /// Parse and check a configuration blob
    pub fn parse(value: &serde_json::Value) -> Result<Self, TriggerError> {
        let config: FileWatchConfig = serde_json::from_value(value.clone())
            .map_err(|e| TriggerError::InvalidConfig(e.to_string()))?;
        if config.location.trim().is_empty() {
            return Err(TriggerError::InvalidConfig("location is required".to_string()));
        }
        if config.poll_interval_secs == 0 {
            return Err(TriggerError::InvalidConfig(
                "pollIntervalSecs must be at least 1".to_string(),
            ));
        }
        config.pattern()?;
        Ok(config)
    }

    /// Compiled file name pattern, anchored at both ends
    pub fn pattern(&self) -> Result<Regex, TriggerError> {
        Regex::new(&format!("^(?:{})$", self.file_pattern)).map_err(|e| {
            TriggerError::InvalidConfig(format!("invalid filePattern '{}': {}", self.file_pattern, e))
        })
    }
}

/// Polls directories for new files
pub struct FileWatchTriggerType {
    submitter: Arc<dyn JobSubmitter>,
    store: Option<Arc<dyn TriggerConfigStore>>,
    watchers: Watchers,
}

impl FileWatchTriggerType {
    pub fn new(submitter: Arc<dyn JobSubmitter>) -> Self {
        Self {
            submitter,
            store: None,
            watchers: Watchers::new(),
        }
    }

    /// Record each poll's time as the trigger's `last_checked`
    pub fn with_store(mut self, store: Arc<dyn TriggerConfigStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Check if a watcher is running for a configuration
    pub async fn is_watching(&self, config: &PipelineTriggerConfig) -> bool {
        self.watchers.is_running(config.id).await
    }

    fn watch_dir(&self, config: &PipelineTriggerConfig, watch: &FileWatchConfig) -> Result<PathBuf, TriggerError> {
        let location = Path::new(&watch.location);
        if location.is_absolute() {
            return Ok(location.to_path_buf());
        }
        let root = self.submitter.pipe_root(&config.container).ok_or_else(|| {
            TriggerError::InvalidConfig(format!(
                "container '{}' has no pipeline root",
                config.container
            ))
        })?;
        Ok(root.resolve(location))
    }
}

/// List matching files under `dir`
fn scan(dir: &Path, recursive: bool, pattern: &Regex) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("Cannot read {}: {}", current.display(), e);
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if recursive {
                    pending.push(path);
                }
                continue;
            }
            let matched = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |name| pattern.is_match(name));
            if matched {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}

#[async_trait]
impl PipelineTriggerType for FileWatchTriggerType {
    fn name(&self) -> &str {
        FILE_WATCH_TYPE
    }

    fn validate_config(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError> {
        FileWatchConfig::parse(&config.configuration).map(|_| ())
    }

    async fn start(&self, config: &PipelineTriggerConfig) -> Result<(), TriggerError> {
        let watch = FileWatchConfig::parse(&config.configuration)?;
        let pattern = watch.pattern()?;
        let dir = self.watch_dir(config, &watch)?;

        let submitter = self.submitter.clone();
        let store = self.store.clone();
        let watched = config.clone();
        let interval = Duration::from_secs(watch.poll_interval_secs);

        let spawned = self
            .watchers
            .start(config.id, move |token| async move {
                info!("Watching {} for trigger '{}'", dir.display(), watched.name);
                let mut seen: HashSet<PathBuf> = HashSet::new();
                let mut first_pass = true;

                loop {
                    let scan_dir = dir.clone();
                    let scan_pattern = pattern.clone();
                    let recursive = watch.recursive;
                    let files = tokio::task::spawn_blocking(move || {
                        scan(&scan_dir, recursive, &scan_pattern)
                    })
                    .await
                    .unwrap_or_default();

                    for file in files {
                        if seen.contains(&file) {
                            continue;
                        }
                        if first_pass && !watch.include_existing {
                            seen.insert(file);
                            continue;
                        }

                        let file_name = file
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let description = watched
                            .description
                            .clone()
                            .unwrap_or_else(|| format!("{} ({})", watched.name, file_name));
                        let request = watched
                            .job_request(description)
                            .with_parameter("file", file.display().to_string());

                        match submitter.submit_request(request).await {
                            Ok(guid) => {
                                info!("Trigger '{}' submitted job {} for {}", watched.name, guid, file.display());
                                seen.insert(file);
                            }
                            // Retried on the next poll
                            Err(e) => warn!("Trigger '{}' failed to submit {}: {}", watched.name, file.display(), e),
                        }
                    }
                    first_pass = false;

                    if let Some(store) = &store {
                        touch_last_checked(store.as_ref(), &watched).await;
                    }

                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }

                debug!("Stopped watching for trigger '{}'", watched.name);
            })
            .await;

        if !spawned {
            debug!("Trigger '{}' is already running", config.name);
        }
        Ok(())
    }

    async fn stop(&self, config: &PipelineTriggerConfig) {
        if self.watchers.stop(config.id).await {
            info!("Stopped trigger '{}'", config.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let config = FileWatchConfig::parse(&serde_json::json!({ "location": "incoming" })).unwrap();
        assert_eq!(config.file_pattern, ".*");
        assert_eq!(config.poll_interval_secs, 10);
        assert!(!config.recursive);
        assert!(!config.include_existing);
    }

    #[test]
    fn test_parse_rejects_bad_config() {
        assert!(FileWatchConfig::parse(&serde_json::json!({})).is_err());
        assert!(FileWatchConfig::parse(&serde_json::json!({
            "location": "incoming",
            "filePattern": "(unclosed"
        }))
        .is_err());
        assert!(FileWatchConfig::parse(&serde_json::json!({
            "location": "incoming",
            "pollIntervalSecs": 0
        }))
        .is_err());
    }

    #[test]
    fn test_scan_matches_full_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.raw"), "").unwrap();
        std::fs::write(dir.path().join("a.raw.tmp"), "").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.raw"), "").unwrap();

        let pattern = FileWatchConfig::parse(&serde_json::json!({
            "location": "x",
            "filePattern": ".*\\.raw"
        }))
        .unwrap()
        .pattern()
        .unwrap();

        assert_eq!(scan(dir.path(), false, &pattern), vec![dir.path().join("a.raw")]);
        assert_eq!(scan(dir.path(), true, &pattern).len(), 2);
    }
}
