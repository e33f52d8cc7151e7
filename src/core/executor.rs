#![allow(clippy::result_large_err)]

//! Step executor: steps run in order, targets within a step run concurrently.

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::condition::evaluate;
use crate::core::workflow::inventory::resolve_targets;
use crate::core::workflow::model::{Handler, HostSpec, Step, Workflow};
use crate::core::workflow::vars::{as_vars, merge_vars, Vars};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// What a runner hands back for one host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunResult {
    pub output: Vars,
}

/// Runs one step on one host.
#[async_trait]
pub trait HostRunner: Send + Sync {
    async fn run(
        &self,
        step: &Step,
        host: &HostSpec,
        vars: Vars,
        cancel: CancellationToken,
    ) -> Result<RunResult, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    Failed,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Success => "success",
            StepOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step lifecycle callbacks. Errors abort the run.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn step_start(&self, step: &Step, targets: &[HostSpec]) -> Result<(), AppError>;
    async fn step_finish(&self, step: &Step, outcome: StepOutcome) -> Result<(), AppError>;
}

pub struct Executor {
    runner: Arc<dyn HostRunner>,
    observer: Option<Arc<dyn Observer>>,
}

impl Executor {
    pub fn new(runner: Arc<dyn HostRunner>) -> Self {
        Self {
            runner,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub async fn run(&self, workflow: &Workflow, cancel: &CancellationToken) -> Result<(), AppError> {
        tracing::debug!(workflow = %workflow.name, steps = workflow.steps.len(), "executor run start");

        let hosts = workflow.inventory.resolve_hosts();
        let handlers: HashMap<&str, &Handler> = workflow
            .handlers
            .iter()
            .map(|h| (h.name.as_str(), h))
            .collect();

        let mut runtime_vars = workflow.vars.clone();
        // Only exports named by a step's expect_vars are visible to later must_vars checks.
        let mut allowed_vars = Vars::new();

        for step in &workflow.steps {
            if !evaluate(&step.when, &runtime_vars)? {
                tracing::debug!(step = %step.name, "executor step skipped by guard");
                continue;
            }
            let targets = resolve_targets(step, &hosts, &workflow.inventory)?;

            tracing::debug!(
                step = %step.name,
                action = %step.action,
                targets = targets.len(),
                "executor step start"
            );
            self.notify_start(step, &targets).await?;

            if let Err(err) = validate_must_vars(&step.must_vars, &targets, &allowed_vars) {
                tracing::debug!(step = %step.name, error = %err, "executor step missing required vars");
                self.notify_finish(step, StepOutcome::Failed).await?;
                return Err(err);
            }

            let items: Vec<Option<&Value>> = if step.loop_items.is_empty() {
                vec![None]
            } else {
                step.loop_items.iter().map(Some).collect()
            };

            let mut step_failed = false;
            let mut step_exports = Vars::new();
            for item in items {
                let iteration = match self
                    .run_on_targets(step, &targets, &runtime_vars, item, cancel)
                    .await
                {
                    Ok(exported) => {
                        if let Some(exported) = exported {
                            step_exports = merge_vars(&step_exports, &exported);
                            runtime_vars = merge_exported_vars(&runtime_vars, &exported);
                        }
                        if step.notify.is_empty() {
                            Ok(())
                        } else {
                            self.run_handlers(&handlers, step, &targets, &runtime_vars, item, cancel)
                                .await
                        }
                    }
                    Err(err) => Err(err),
                };

                if let Err(err) = iteration {
                    tracing::debug!(step = %step.name, error = %err, "executor step failed");
                    if step.continue_on_error && !err.is_canceled() {
                        step_failed = true;
                        break;
                    }
                    self.notify_finish(step, StepOutcome::Failed).await?;
                    return Err(err);
                }
            }

            if !step_failed && !step.expect_vars.is_empty() {
                match validate_expected_vars(&step.expect_vars, &step_exports) {
                    Ok(()) => {
                        let promoted = select_expected_vars(&step_exports, &step.expect_vars);
                        allowed_vars = merge_vars(&allowed_vars, &promoted);
                    }
                    Err(err) => {
                        tracing::debug!(step = %step.name, error = %err, "executor step expected vars missing");
                        if !step.continue_on_error {
                            self.notify_finish(step, StepOutcome::Failed).await?;
                            return Err(err);
                        }
                        step_failed = true;
                    }
                }
            }

            let outcome = if step_failed {
                StepOutcome::Failed
            } else {
                StepOutcome::Success
            };
            self.notify_finish(step, outcome).await?;
            tracing::debug!(step = %step.name, failed = step_failed, "executor step done");
        }

        tracing::debug!(workflow = %workflow.name, "executor run done");
        Ok(())
    }

    async fn notify_start(&self, step: &Step, targets: &[HostSpec]) -> Result<(), AppError> {
        match &self.observer {
            Some(observer) => observer.step_start(step, targets).await,
            None => Ok(()),
        }
    }

    async fn notify_finish(&self, step: &Step, outcome: StepOutcome) -> Result<(), AppError> {
        match &self.observer {
            Some(observer) => observer.step_finish(step, outcome).await,
            None => Ok(()),
        }
    }

    /// Fan out one attempt loop per target and wait for all of them before looking at results.
    async fn run_on_targets(
        &self,
        step: &Step,
        targets: &[HostSpec],
        base_vars: &Vars,
        item: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vars>, AppError> {
        let attempt_timeout = parse_timeout(&step.timeout)?;

        let runs = targets.iter().map(|target| {
            let mut vars = merge_vars(&target.vars, base_vars);
            if let Some(item) = item {
                vars.insert("item".to_string(), item.clone());
            }
            self.run_with_retry(step, target, vars, attempt_timeout, cancel)
        });
        let results = join_all(runs).await;

        let mut merged = Vars::new();
        for result in results {
            let result = result?;
            if let Some(exported) = extract_exported_vars(&result.output) {
                merged = merge_vars(&merged, &exported);
            }
        }
        Ok((!merged.is_empty()).then_some(merged))
    }

    async fn run_handlers(
        &self,
        handlers: &HashMap<&str, &Handler>,
        step: &Step,
        targets: &[HostSpec],
        base_vars: &Vars,
        item: Option<&Value>,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        let mut seen = HashSet::new();
        for name in &step.notify {
            if !seen.insert(name.as_str()) {
                continue;
            }
            let handler = handlers.get(name.as_str()).ok_or_else(|| {
                AppError::new(
                    ErrorCategory::ResolutionError,
                    format!("handler \"{}\" not found", name),
                )
                .with_code("FF-EXEC-004")
            })?;
            tracing::debug!(handler = %handler.name, step = %step.name, "executor handler start");

            let mut guard_vars = base_vars.clone();
            if let Some(item) = item {
                guard_vars.insert("item".to_string(), item.clone());
            }
            if !evaluate(&handler.when, &guard_vars)? {
                continue;
            }
            self.run_on_targets(&handler.as_step(), targets, base_vars, item, cancel)
                .await?;
        }
        Ok(())
    }

    async fn run_with_retry(
        &self,
        step: &Step,
        host: &HostSpec,
        vars: Vars,
        attempt_timeout: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<RunResult, AppError> {
        let attempts = step.retries.saturating_add(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(AppError::canceled(format!("step \"{}\"", step.name)));
            }
            let attempt_cancel = cancel.child_token();
            let run = self
                .runner
                .run(step, host, vars.clone(), attempt_cancel.clone());
            let outcome = match attempt_timeout {
                Some(limit) => match timeout(limit, run).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        attempt_cancel.cancel();
                        Err(AppError::new(
                            ErrorCategory::TimeoutError,
                            format!(
                                "step \"{}\" on host {} timed out after {}",
                                step.name,
                                host.name,
                                humantime::format_duration(limit)
                            ),
                        )
                        .with_code("FF-EXEC-003"))
                    }
                },
                None => run.await,
            };

            match outcome {
                Ok(result) => return Ok(result),
                Err(err) => {
                    tracing::debug!(
                        step = %step.name,
                        host = %host.name,
                        attempt,
                        error = %err,
                        "executor retry"
                    );
                    if err.is_canceled() {
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            AppError::new(ErrorCategory::InternalError, "step made no attempts")
        }))
    }
}

/// Empty means no per-attempt timeout.
pub fn parse_timeout(raw: &str) -> Result<Option<Duration>, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    humantime::parse_duration(trimmed).map(Some).map_err(|_| {
        AppError::new(
            ErrorCategory::ValidationError,
            format!("invalid timeout \"{}\"", raw),
        )
        .with_code("FF-EXEC-005")
    })
}

fn missing_keys(required: &[String], vars: &Vars) -> Vec<String> {
    required
        .iter()
        .map(|key| key.trim())
        .filter(|key| !key.is_empty() && !vars.contains_key(*key))
        .map(str::to_string)
        .collect()
}

fn validate_must_vars(
    required: &[String],
    targets: &[HostSpec],
    allowed_vars: &Vars,
) -> Result<(), AppError> {
    if required.is_empty() {
        return Ok(());
    }
    for target in targets {
        let merged = merge_vars(&target.vars, allowed_vars);
        let missing = missing_keys(required, &merged);
        if !missing.is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                format!(
                    "required vars missing for host {}: {}",
                    target.name,
                    missing.join(", ")
                ),
            )
            .with_code("FF-EXEC-001"));
        }
    }
    Ok(())
}

fn validate_expected_vars(expected: &[String], exported: &Vars) -> Result<(), AppError> {
    let missing = missing_keys(expected, exported);
    if missing.is_empty() {
        return Ok(());
    }
    Err(AppError::new(
        ErrorCategory::ValidationError,
        format!("expected vars missing: {}", missing.join(", ")),
    )
    .with_code("FF-EXEC-002"))
}

fn select_expected_vars(exported: &Vars, expected: &[String]) -> Vars {
    expected
        .iter()
        .map(|key| key.trim())
        .filter_map(|key| exported.get(key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

/// Overlay exported vars onto the scope and mirror them into the `env` sub-map.
pub fn merge_exported_vars(base: &Vars, exported: &Vars) -> Vars {
    if exported.is_empty() {
        return base.clone();
    }
    let mut next = merge_vars(base, exported);
    let mut env = next.get("env").and_then(as_vars).unwrap_or_default();
    for (key, value) in exported {
        env.insert(key.clone(), value.clone());
    }
    if !env.is_empty() {
        next.insert("env".to_string(), Value::Object(env));
    }
    next
}

fn extract_exported_vars(output: &Vars) -> Option<Vars> {
    output
        .get("vars")
        .and_then(as_vars)
        .filter(|vars| !vars.is_empty())
}
