//! Per-job log file

use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// Appends timestamped lines to a job's log file
///
/// Line format: `16 Oct 2026 14:03:07,412 INFO : message`.
#[derive(Debug, Clone)]
pub struct JobLog {
    path: Arc<PathBuf>,
}

impl JobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn debug(&self, message: &str) {
        self.write("DEBUG", message).await;
    }

    pub async fn info(&self, message: &str) {
        self.write("INFO", message).await;
    }

    pub async fn warn(&self, message: &str) {
        self.write("WARN", message).await;
    }

    pub async fn error(&self, message: &str) {
        self.write("ERROR", message).await;
    }

    /// Write a message followed by a separator line
    pub async fn header(&self, message: &str) {
        self.info(message).await;
        self.info("=======================================").await;
    }

    /// Read the whole log, empty if it does not exist yet
    pub async fn contents(&self) -> String {
        fs::read_to_string(self.path.as_path())
            .await
            .unwrap_or_default()
    }

    async fn write(&self, level: &str, message: &str) {
        let timestamp = Local::now().format("%d %b %Y %H:%M:%S,%3f");
        let mut text = String::new();
        for line in message.lines() {
            text.push_str(&format!("{} {:<5}: {}\n", timestamp, level, line));
        }
        if text.is_empty() {
            text = format!("{} {:<5}: \n", timestamp, level);
        }

        if let Err(e) = self.append(text.as_bytes()).await {
            warn!("Failed to write job log {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_path())
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_lines_have_level_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path().join("logs").join("job.log"));

        log.info("starting").await;
        log.error("boom\nsecond line").await;

        let contents = log.contents().await;
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("INFO : starting"));
        assert!(lines[1].ends_with("ERROR: boom"));
        assert!(lines[2].ends_with("ERROR: second line"));
    }

    #[tokio::test]
    async fn test_header_writes_separator() {
        let dir = tempfile::tempdir().unwrap();
        let log = JobLog::new(dir.path().join("job.log"));
        log.header("Convert").await;
        let contents = log.contents().await;
        assert!(contents.contains("Convert"));
        assert!(contents.contains("====="));
    }
}
