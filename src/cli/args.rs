use clap::Args;
use std::path::PathBuf;

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Workflow definition (YAML or JSON)
    #[arg(value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// Emit either terminal-friendly text or machine-readable JSON
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct ApplyArgs {
    /// Workflow definition (YAML or JSON)
    #[arg(value_name = "WORKFLOW")]
    pub workflow: PathBuf,

    /// Dispatch through the remote agent at this base url instead of running locally
    #[arg(long, value_name = "URL", help_heading = "Dispatch")]
    pub agent: Option<String>,

    /// Use this run id instead of generating one
    #[arg(long, value_name = "RUN_ID", help_heading = "Run State")]
    pub run_id: Option<String>,

    /// Run state file (default: [state].file from fleetflow.toml)
    #[arg(long, value_name = "FILE", help_heading = "Run State")]
    pub state_file: Option<PathBuf>,

    /// Print each host result and streamed agent output
    #[arg(short, long, help_heading = "Output Options")]
    pub verbose: bool,

    /// Emit the final run state as JSON
    #[arg(long, help_heading = "Output Options")]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ValidateArgs {
    /// Workflow definition (YAML or JSON)
    #[arg(value_name = "WORKFLOW")]
    pub workflow: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct RunsArgs {
    /// Only show runs with this status (queued, running, success, failed, canceled, interrupted)
    #[arg(long, value_name = "STATUS")]
    pub status: Option<String>,

    /// Show at most this many runs, newest first (0 shows all)
    #[arg(long, default_value = "20", value_name = "N")]
    pub limit: usize,

    /// Show one run in full
    #[arg(long, value_name = "RUN_ID")]
    pub run_id: Option<String>,

    /// Run state file (default: [state].file from fleetflow.toml)
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,

    /// Emit either terminal-friendly text or machine-readable JSON
    #[arg(long, default_value = "text", value_name = "FORMAT")]
    pub format: OutputFormat,
}

#[derive(Args, Debug, Clone)]
pub struct ReconcileArgs {
    /// Reason recorded on every interrupted run
    #[arg(long, default_value = "controller restarted", value_name = "TEXT")]
    pub reason: String,

    /// Run state file (default: [state].file from fleetflow.toml)
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct AgentArgs {
    /// Listen address (default: [server].bind from fleetflow.toml)
    #[arg(long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Require this bearer token on every request
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Run state file mirroring agent task progress (default: kept in memory). Use a file of
    /// its own, not the controller's [state].file
    #[arg(long, value_name = "FILE")]
    pub state_file: Option<PathBuf>,
}

#[derive(Clone, Copy, clap::ValueEnum, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable summary
    Text,
    /// Pretty-printed JSON
    Json,
}
