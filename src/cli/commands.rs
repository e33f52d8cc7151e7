use crate::{
    cli::args::{
        AgentArgs, ApplyArgs, OutputFormat, PlanArgs, ReconcileArgs, RunsArgs, ValidateArgs,
    },
    core::{
        agent_server::AgentServer,
        dispatch::{AgentDispatcher, Dispatcher, TaskResult},
        engine::{Engine, Plan, Recorder, RunOptions},
        error::describe,
        executor::{Observer, StepOutcome},
        modules::ModuleRegistry,
        state::{
            validate_run_status, FileRunStore, HttpNotifier, InMemoryRunStore, ListFilter,
            RunState, RunStateStore,
        },
        workflow::{load_file, value_to_string, HostSpec, Step, Workflow},
        AppError, ConfigLoader, ConfigValidator, FleetflowConfig,
    },
    Result,
};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Load `fleetflow.toml` (or the `--config` override) with env overrides, then validate it.
pub fn load_config(config_path: Option<&Path>) -> Result<FleetflowConfig> {
    let config = match config_path {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => {
            let cwd = env::current_dir().context("failed to resolve current directory")?;
            ConfigLoader::load_from_workspace(&cwd)?
        }
    };
    ConfigValidator::validate(&config)?;
    Ok(config)
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let workflow = load_file(path).map_err(cli_error)?;
    workflow.validate().map_err(cli_error)?;
    Ok(workflow)
}

fn state_path(override_path: Option<PathBuf>, config: &FleetflowConfig) -> PathBuf {
    override_path.unwrap_or_else(|| config.state.file.clone())
}

fn cli_error(err: AppError) -> anyhow::Error {
    anyhow!(describe(&err))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to encode output")?
    );
    Ok(())
}

/// Cancel the returned token on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; canceling");
            trigger.cancel();
        }
    });
    cancel
}

pub async fn plan(args: PlanArgs) -> Result<()> {
    tracing::debug!(file = %args.workflow.display(), "plan start");
    let workflow = load_workflow(&args.workflow)?;
    let engine = Engine::new(ModuleRegistry::with_builtins()?);
    let plan = engine.plan(&workflow).await.map_err(cli_error)?;
    match args.format {
        OutputFormat::Json => print_json(&plan),
        OutputFormat::Text => {
            print_plan(&plan);
            Ok(())
        }
    }
}

fn print_plan(plan: &Plan) {
    println!("Plan {} for workflow {}", plan.id, plan.workflow_name);
    for step in &plan.steps {
        println!(
            "\n{} ({}) on [{}]",
            step.name,
            step.action,
            step.targets.join(", ")
        );
        if step.changes.is_empty() {
            println!("  no changes");
        }
        for change in &step.changes {
            println!("  ~ {}", change.resource_id);
            for (key, entry) in &change.diff {
                println!(
                    "      {}: {} -> {}",
                    key,
                    value_to_string(&entry.current),
                    value_to_string(&entry.desired)
                );
            }
        }
    }
    println!("\nPlan: {} change(s).", plan.change_count());
}

pub async fn apply(args: ApplyArgs, config_path: Option<&Path>) -> Result<()> {
    tracing::debug!(file = %args.workflow.display(), "apply start");
    let config = load_config(config_path)?;
    let workflow = load_workflow(&args.workflow)?;
    let registry = ModuleRegistry::with_builtins()?;

    let store = Arc::new(FileRunStore::new(state_path(args.state_file, &config)));
    let mut engine = Engine::new(registry).with_store(store);

    let mut agent_settings = config.agent.dispatcher_settings()?;
    if let Some(url) = args.agent.as_deref() {
        agent_settings.base_url = url.trim().to_string();
    }
    if !agent_settings.base_url.is_empty() {
        tracing::info!(base_url = %agent_settings.base_url, "dispatching through remote agent");
        let mut dispatcher = AgentDispatcher::new(agent_settings);
        if args.verbose {
            dispatcher = dispatcher.with_output_callback(Arc::new(
                |_task_id: &str, step: &str, host: &str, stream: &str, chunk: &str| {
                    for line in chunk.lines() {
                        println!("  [{} {} {}] {}", step, host, stream, line);
                    }
                },
            ));
        }
        engine = engine.with_dispatcher(Arc::new(dispatcher) as Arc<dyn Dispatcher>);
    }

    if let Some(url) = config.notify.url() {
        let notifier = HttpNotifier::new(url, &config.notify.headers);
        engine = engine.with_notifier(
            Arc::new(notifier),
            config.notify.retry,
            config.notify.delay()?,
        );
    }

    let options = RunOptions {
        run_id: args.run_id.unwrap_or_default(),
        recorder: args
            .verbose
            .then(|| Arc::new(ConsoleRecorder) as Arc<dyn Recorder>),
        ..RunOptions::default()
    };

    let cancel = interrupt_token();
    match engine.apply_with_run(&workflow, options, &cancel).await {
        Ok(run) => {
            if args.json {
                print_json(&run)?;
            } else {
                println!("run {} {}", run.run_id, run.status);
            }
            Ok(())
        }
        Err(failure) => {
            if let Some(run) = &failure.run {
                if args.json {
                    print_json(run)?;
                } else {
                    println!("run {} {}", run.run_id, run.status);
                }
            }
            Err(cli_error(failure.error))
        }
    }
}

/// Prints step and host progress for `apply --verbose`.
struct ConsoleRecorder;

#[async_trait]
impl Observer for ConsoleRecorder {
    async fn step_start(
        &self,
        step: &Step,
        targets: &[HostSpec],
    ) -> std::result::Result<(), AppError> {
        let names: Vec<&str> = targets.iter().map(|target| target.name.as_str()).collect();
        println!("==> {} ({}) on [{}]", step.name, step.action, names.join(", "));
        Ok(())
    }

    async fn step_finish(
        &self,
        step: &Step,
        outcome: StepOutcome,
    ) -> std::result::Result<(), AppError> {
        println!("<== {} {}", step.name, outcome);
        Ok(())
    }
}

#[async_trait]
impl Recorder for ConsoleRecorder {
    async fn host_result(
        &self,
        _step: &Step,
        host: &HostSpec,
        result: &TaskResult,
    ) -> std::result::Result<(), AppError> {
        println!("  {}: {}", host.name, result.status);
        for stream in ["stdout", "stderr"] {
            if let Some(text) = result.output.get(stream).and_then(|v| v.as_str()) {
                for line in text.lines().filter(|line| !line.trim().is_empty()) {
                    println!("    {}", line);
                }
            }
        }
        if !result.error.is_empty() {
            println!("    error: {}", result.error);
        }
        Ok(())
    }
}

pub fn validate(args: ValidateArgs) -> Result<()> {
    let workflow = load_file(&args.workflow).map_err(cli_error)?;
    let issues = workflow.validation_issues();
    if issues.is_empty() {
        println!(
            "workflow {} is valid ({} step(s))",
            workflow.name,
            workflow.steps.len()
        );
        return Ok(());
    }
    for issue in &issues {
        println!("- {}", issue);
    }
    Err(anyhow!(
        "workflow {} has {} validation issue(s)",
        args.workflow.display(),
        issues.len()
    ))
}

pub async fn runs(args: RunsArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = FileRunStore::new(state_path(args.state_file, &config));

    if let Some(run_id) = args.run_id.as_deref() {
        let run = store.get_run(run_id).await.map_err(cli_error)?;
        return match args.format {
            OutputFormat::Json => print_json(&run),
            OutputFormat::Text => {
                print_run_detail(&run);
                Ok(())
            }
        };
    }

    let status = match args.status.as_deref().map(str::trim) {
        Some(raw) if !raw.is_empty() => validate_run_status(raw).map_err(cli_error)?.to_string(),
        _ => String::new(),
    };
    let runs = store
        .list_runs(&ListFilter {
            status,
            limit: args.limit,
        })
        .await
        .map_err(cli_error)?;

    match args.format {
        OutputFormat::Json => print_json(&runs),
        OutputFormat::Text => {
            if runs.is_empty() {
                println!("no runs");
                return Ok(());
            }
            println!("{:<40} {:<12} {:<24} UPDATED", "RUN ID", "STATUS", "WORKFLOW");
            for run in &runs {
                let updated = run
                    .updated_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<40} {:<12} {:<24} {}",
                    run.run_id, run.status, run.workflow_name, updated
                );
            }
            Ok(())
        }
    }
}

fn print_run_detail(run: &RunState) {
    println!("run {} ({}) {}", run.run_id, run.workflow_name, run.status);
    if !run.message.is_empty() {
        println!("  message: {}", run.message);
    }
    if !run.last_error.is_empty() {
        println!("  last error: {}", run.last_error);
    }
    if !run.interrupted_reason.is_empty() {
        println!("  interrupted: {}", run.interrupted_reason);
    }
    for step in &run.steps {
        println!("  step {} {}", step.name, step.status);
        for host in step.hosts.values() {
            if host.message.is_empty() {
                println!("    {} {}", host.host, host.status);
            } else {
                println!("    {} {} ({})", host.host, host.status, host.message);
            }
        }
    }
}

pub async fn reconcile(args: ReconcileArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let store = Arc::new(FileRunStore::new(state_path(args.state_file, &config)));
    let engine = Engine::new(ModuleRegistry::with_builtins()?).with_store(store);
    let updated = engine
        .reconcile_running(None, &args.reason)
        .await
        .map_err(cli_error)?;
    println!("{} run(s) marked interrupted", updated);
    Ok(())
}

pub async fn agent(args: AgentArgs, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut settings = config.server.server_settings()?;
    if let Some(bind) = args.bind {
        settings.bind = bind.trim().to_string();
    }
    if let Some(token) = args.token {
        settings.token = token.trim().to_string();
    }

    let store: Arc<dyn RunStateStore> = match args.state_file {
        Some(path) => {
            if path == config.state.file {
                tracing::warn!(
                    file = %path.display(),
                    "agent state file is the controller's run state file; runs will be shared"
                );
            }
            Arc::new(FileRunStore::new(path))
        }
        None => Arc::new(InMemoryRunStore::new()),
    };

    let server = AgentServer::new(ModuleRegistry::with_builtins()?, store, settings).await;
    let shutdown = interrupt_token();
    server.serve(shutdown, None).await.map_err(cli_error)
}
