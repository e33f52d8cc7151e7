#![allow(clippy::result_large_err)] // Modules return AppError to surface process diagnostics without boxing.

use crate::core::error::AppError;
use crate::core::modules::export::{export_vars_enabled, parse_export_vars};
use crate::core::modules::output::{apply_output_limits, OutputSink};
use crate::core::modules::{
    invalid_args, rollback_unsupported, Module, ModuleFailure, ModuleRequest, ModuleResult,
};
use crate::core::types::ErrorCategory;
use crate::core::workflow::render::render_string;
use crate::core::workflow::vars::{string_pairs, Vars};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

const SHELL: &str = "/bin/sh";

/// `cmd.run`: `args.cmd` executed through `/bin/sh -c`.
#[derive(Debug, Default)]
pub struct CommandModule;

impl CommandModule {
    pub fn new() -> Self {
        Self
    }
}

/// `shell.run`: `args.script` fed to `/bin/sh -s` on stdin.
#[derive(Debug, Default)]
pub struct ShellModule;

impl ShellModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Module for CommandModule {
    async fn check(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        let cmd = required_arg(request, "cmd", "cmd.run requires args.cmd")?;
        Ok(ModuleResult {
            changed: true,
            diff: vars_of(json!({ "cmd": cmd })),
            ..ModuleResult::default()
        })
    }

    async fn apply(&self, request: &ModuleRequest) -> Result<ModuleResult, ModuleFailure> {
        let cmd = required_arg(request, "cmd", "cmd.run requires args.cmd")?;
        let mut command = Command::new(SHELL);
        command.arg("-c").arg(&cmd);
        run_module("cmd.run", command, None, request).await
    }

    async fn rollback(&self, _request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        Err(rollback_unsupported("cmd.run"))
    }
}

#[async_trait]
impl Module for ShellModule {
    async fn check(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        let script = required_arg(request, "script", "shell.run requires args.script")?;
        Ok(ModuleResult {
            changed: true,
            diff: vars_of(json!({ "shell": script })),
            ..ModuleResult::default()
        })
    }

    async fn apply(&self, request: &ModuleRequest) -> Result<ModuleResult, ModuleFailure> {
        let script = required_arg(request, "script", "shell.run requires args.script")?;
        let mut command = Command::new(SHELL);
        command.arg("-s").arg("--");
        run_module("shell.run", command, Some(script), request).await
    }

    async fn rollback(&self, _request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        Err(rollback_unsupported("shell.run"))
    }
}

fn required_arg(request: &ModuleRequest, key: &str, message: &str) -> Result<String, AppError> {
    match request.arg_string(key) {
        Some(value) if !value.trim().is_empty() => Ok(render_string(&value, &request.vars)),
        _ => Err(invalid_args(message)),
    }
}

fn vars_of(value: Value) -> Vars {
    match value {
        Value::Object(map) => map,
        _ => Vars::new(),
    }
}

/// Environment for the child: `vars.env` first, then `args.env` on top.
fn merged_env(request: &ModuleRequest) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for source in [request.vars.get("env"), request.step.args.get("env")]
        .into_iter()
        .flatten()
    {
        for (key, value) in string_pairs(source) {
            env.insert(key, render_string(&value, &request.vars));
        }
    }
    env
}

async fn run_module(
    action: &str,
    mut command: Command,
    stdin: Option<String>,
    request: &ModuleRequest,
) -> Result<ModuleResult, ModuleFailure> {
    if let Some(dir) = request.arg_string("dir").filter(|d| !d.trim().is_empty()) {
        command.current_dir(render_string(&dir, &request.vars));
    }
    command.envs(merged_env(request));

    tracing::debug!(
        action,
        step = %request.step.name,
        host = %request.host.name,
        "executing command"
    );
    let start = Instant::now();
    let process = run_process(command, stdin, request).await?;
    let (stdout, stderr) = apply_output_limits(&request.step, process.stdout, process.stderr);

    let mut output = Vars::new();
    if export_vars_enabled(&request.step) {
        if let Some(exports) = parse_export_vars(&stdout) {
            output.insert("vars".into(), Value::Object(exports));
        }
    }
    output.insert("stdout".into(), Value::String(stdout));
    output.insert("stderr".into(), Value::String(stderr));
    output.insert(
        "duration_ms".into(),
        json!(start.elapsed().as_millis() as u64),
    );
    if let Some(code) = process.status.code() {
        output.insert("exit_code".into(), json!(code));
    }

    if !process.status.success() {
        let mut err = AppError::new(
            ErrorCategory::ExecutionError,
            format!("{} failed: {}", action, process.status),
        )
        .with_code("FF-CMD-001");
        err.add_context("host", &request.host.name);
        return Err(ModuleFailure::new(err, output));
    }

    Ok(ModuleResult {
        changed: true,
        diff: Vars::new(),
        output,
    })
}

struct ProcessOutput {
    stdout: String,
    stderr: String,
    status: ExitStatus,
}

async fn run_process(
    mut command: Command,
    stdin: Option<String>,
    request: &ModuleRequest,
) -> Result<ProcessOutput, AppError> {
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(|err| {
        AppError::new(
            ErrorCategory::ExecutionError,
            format!("failed to execute command: {}", err),
        )
        .with_code("FF-CMD-002")
    })?;

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let feed = async move {
        if let (Some(mut pipe), Some(script)) = (stdin_pipe, stdin) {
            // The child may exit before reading everything; that shows up in its status.
            let _ = pipe.write_all(script.as_bytes()).await;
        }
    };
    let collect = async {
        let (_, stdout, stderr) = tokio::join!(
            feed,
            pump(stdout_pipe, request.stdout.clone()),
            pump(stderr_pipe, request.stderr.clone())
        );
        let status = child.wait().await;
        (stdout, stderr, status)
    };

    let (stdout, stderr, status) = tokio::select! {
        _ = request.cancel.cancelled() => {
            return Err(AppError::canceled(format!("step \"{}\"", request.step.name)));
        }
        collected = collect => collected,
    };
    let status = status.map_err(|err| {
        AppError::new(
            ErrorCategory::ExecutionError,
            format!("failed to wait for command: {}", err),
        )
        .with_code("FF-CMD-002")
    })?;

    Ok(ProcessOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        status,
    })
}

async fn pump<R: AsyncRead + Unpin>(pipe: Option<R>, sink: Option<Arc<dyn OutputSink>>) -> Vec<u8> {
    let mut collected = Vec::new();
    let Some(mut pipe) = pipe else {
        return collected;
    };
    let mut buf = [0u8; 4096];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Some(sink) = &sink {
                    sink.write(&buf[..n]);
                }
                collected.extend_from_slice(&buf[..n]);
            }
        }
    }
    collected
}
