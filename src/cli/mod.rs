//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, RunCommand, StatusCommand, TriggersCommand, ValidateCommand, WatchCommand,
};
use std::ffi::OsString;

/// Pipeline job runner and status tool
#[derive(Debug, Parser, Clone)]
#[command(name = "pipejob")]
#[command(version = "0.1.0")]
#[command(about = "Run pipeline jobs, track their status and manage triggers", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a job locally and wait for it
    Run(RunCommand),

    /// Show job statuses
    Status(StatusCommand),

    /// Cancel a job
    Cancel(CancelCommand),

    /// List trigger configurations
    Triggers(TriggersCommand),

    /// Run triggers and remote reconciliation until Ctrl-C
    Watch(WatchCommand),

    /// Validate a configuration
    Validate(ValidateCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "pipejob", "run", "-f", "jobs.yaml", "-p", "search", "-c", "home", "--param", "file=a.raw",
        ])
        .unwrap();
        match cli.command {
            Command::Run(cmd) => {
                assert_eq!(cmd.pipeline, "search");
                assert_eq!(cmd.param, vec![("file".to_string(), "a.raw".to_string())]);
                assert_eq!(cmd.user, "cli");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_cancel_requires_job() {
        assert!(Cli::try_parse_from(["pipejob", "cancel"]).is_err());
        assert!(Cli::try_parse_from(["pipejob", "-v", "cancel", "--job", "abc"]).is_ok());
    }
}
