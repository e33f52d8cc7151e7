pub mod args;
pub mod commands;

pub use args::{
    AgentArgs, ApplyArgs, OutputFormat, PlanArgs, ReconcileArgs, RunsArgs, ValidateArgs,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

const HELP_TEMPLATE: &str = "\
{name} {version}\n\
{about-with-newline}\n\
USAGE:\n    {usage}\n\
\nOPTIONS:\n{options}\n\
COMMANDS:\n{subcommands}\n";

#[derive(Parser)]
#[command(name = "fleetflow")]
#[command(version = crate::VERSION)]
#[command(about = "Run conditional workflow steps across host inventories")]
#[command(help_template = HELP_TEMPLATE)]
#[command(
    after_long_help = "Typical flow: validate a workflow, review its plan, apply it, then inspect runs."
)]
pub struct Args {
    /// Config file (default: ./fleetflow.toml when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    #[command(
        about = "Show what a workflow would change",
        long_about = "Plan evaluates step guards, resolves targets, and asks every module what it would change without changing anything.",
        after_help = "Example:\n    fleetflow plan ./deploy.yaml --format json"
    )]
    Plan(PlanArgs),
    #[command(
        about = "Execute a workflow and record the run",
        long_about = "Apply runs every step across its targets, locally or through a remote agent, and persists the run state.",
        after_help = "Example:\n    fleetflow apply ./deploy.yaml --agent http://10.0.0.5:7072"
    )]
    Apply(ApplyArgs),
    #[command(
        about = "Check a workflow definition",
        long_about = "Validate loads a workflow and reports every structural problem it finds.",
        after_help = "Example:\n    fleetflow validate ./deploy.yaml"
    )]
    Validate(ValidateArgs),
    #[command(
        about = "List recorded runs",
        long_about = "Runs reads the run state store and lists runs newest first, optionally filtered by status.",
        after_help = "Example:\n    fleetflow runs --status failed --limit 5"
    )]
    Runs(RunsArgs),
    #[command(
        about = "Mark runs left running as interrupted",
        long_about = "Reconcile marks every run still recorded as running as interrupted, for use after a controller crash.",
        after_help = "Example:\n    fleetflow reconcile --reason \"host rebooted\""
    )]
    Reconcile(ReconcileArgs),
    #[command(
        about = "Serve the remote agent HTTP API",
        long_about = "Agent executes tasks dispatched by a controller and reports task status and run progress.",
        after_help = "Example:\n    fleetflow agent --bind 0.0.0.0:7072 --token s3cret"
    )]
    Agent(AgentArgs),
}

pub async fn run(args: Args) -> crate::Result<()> {
    let config = args.config.as_deref();
    match args.command {
        Command::Plan(plan_args) => commands::plan(plan_args).await,
        Command::Apply(apply_args) => commands::apply(apply_args, config).await,
        Command::Validate(validate_args) => commands::validate(validate_args),
        Command::Runs(runs_args) => commands::runs(runs_args, config).await,
        Command::Reconcile(reconcile_args) => commands::reconcile(reconcile_args, config).await,
        Command::Agent(agent_args) => commands::agent(agent_args, config).await,
    }
}
