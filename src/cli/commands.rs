//! CLI command definitions

use clap::Args;

/// Run one job of a pipeline and wait for it
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to configuration YAML file
    #[arg(short, long)]
    pub file: String,

    /// Pipeline id, e.g. `search` or `pipeline:search`
    #[arg(short, long)]
    pub pipeline: String,

    /// Container the job belongs to
    #[arg(short, long)]
    pub container: String,

    /// User recorded on the job
    #[arg(long, default_value = "cli")]
    pub user: String,

    /// Job parameters (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub param: Vec<(String, String)>,

    /// Don't save the job status to the database
    #[arg(long)]
    pub no_history: bool,
}

/// Show job statuses
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Path to configuration YAML file (for the database location)
    #[arg(short, long)]
    pub file: Option<String>,

    /// Only jobs in this container
    #[arg(short, long)]
    pub container: Option<String>,

    /// Show a single job
    #[arg(long)]
    pub job: Option<String>,

    /// Number of jobs to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Cancel a job
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    /// Path to configuration YAML file (for the database location)
    #[arg(short, long)]
    pub file: Option<String>,

    /// Job GUID
    #[arg(long)]
    pub job: String,
}

/// List trigger configurations
#[derive(Debug, Args, Clone)]
pub struct TriggersCommand {
    /// Path to configuration YAML file
    #[arg(short, long)]
    pub file: String,

    /// Only triggers in this container
    #[arg(short, long)]
    pub container: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Start enabled triggers and the remote reconciler until interrupted
#[derive(Debug, Args, Clone)]
pub struct WatchCommand {
    /// Path to configuration YAML file
    #[arg(short, long)]
    pub file: String,
}

/// Validate a configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to configuration YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
