#![allow(clippy::result_large_err)]

use crate::core::dispatch::{Dispatcher, Task, TaskResult, TaskStatus};
use crate::core::engine::recorder::Recorder;
use crate::core::error::AppError;
use crate::core::executor::{HostRunner, RunResult};
use crate::core::state::run_id::unix_nanos;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::{HostSpec, Step};
use crate::core::workflow::vars::{value_to_string, Vars};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const ENV_SET_ACTION: &str = "env.set";

/// Bridges the executor to a dispatcher: one task per (step, host), with the environment
/// accumulated from earlier `env.set` steps injected into every task.
pub struct DispatchRunner {
    dispatcher: Arc<dyn Dispatcher>,
    recorder: Option<Arc<dyn Recorder>>,
    env: Mutex<BTreeMap<String, String>>,
    run_id: String,
}

impl DispatchRunner {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, run_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            recorder: None,
            env: Mutex::new(BTreeMap::new()),
            run_id: run_id.into(),
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn Recorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_env(self, env: BTreeMap<String, String>) -> Self {
        *self.env_lock() = env;
        self
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        self.env_lock().clone()
    }

    fn env_lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.env.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn task_id(&self, step: &Step, host: &HostSpec) -> String {
        let id = format!("task-{}-{}-{}", step.name, host.name, unix_nanos());
        if self.run_id.trim().is_empty() {
            id
        } else {
            format!("{}-{}", self.run_id, id)
        }
    }

    /// The accumulated env is laid over any `env` map already in scope.
    fn inject_env(&self, mut vars: Vars) -> Vars {
        let env = self.env_lock().clone();
        if env.is_empty() {
            return vars;
        }
        let mut merged = match vars.remove("env") {
            Some(Value::Object(existing)) => existing,
            _ => Vars::new(),
        };
        for (key, value) in env {
            merged.insert(key, Value::String(value));
        }
        vars.insert("env".to_string(), Value::Object(merged));
        vars
    }

    fn merge_env_from_output(&self, output: &Vars) {
        let Some(Value::Object(env)) = output.get("env") else {
            return;
        };
        if env.is_empty() {
            return;
        }
        let mut current = self.env_lock();
        for (key, value) in env {
            current.insert(key.clone(), value_to_string(value));
        }
    }
}

#[async_trait]
impl HostRunner for DispatchRunner {
    async fn run(
        &self,
        step: &Step,
        host: &HostSpec,
        vars: Vars,
        cancel: CancellationToken,
    ) -> Result<RunResult, AppError> {
        tracing::debug!(
            run_id = %self.run_id,
            step = %step.name,
            action = %step.action,
            host = %host.name,
            "dispatch run"
        );
        let task = Task {
            id: self.task_id(step, host),
            run_id: self.run_id.clone(),
            step: step.clone(),
            host: host.clone(),
            vars: self.inject_env(vars),
        };
        let task_id = task.id.clone();

        let (result, failure) = match self.dispatcher.dispatch(task, cancel).await {
            Ok(result) => (result, None),
            Err(err) => {
                let mut partial = err.partial;
                if partial.task_id.is_empty() {
                    partial.task_id = task_id;
                }
                if partial.status == TaskStatus::Unset {
                    partial.status = if err.error.is_canceled() {
                        TaskStatus::Canceled
                    } else {
                        TaskStatus::Failed
                    };
                }
                if partial.error.is_empty() {
                    partial.error = err.error.to_string();
                }
                (partial, Some(err.error))
            }
        };

        if let Some(recorder) = &self.recorder {
            recorder.host_result(step, host, &result).await?;
        }
        if step.action.trim() == ENV_SET_ACTION {
            self.merge_env_from_output(&result.output);
        }

        if let Some(err) = failure {
            tracing::debug!(
                run_id = %self.run_id,
                step = %step.name,
                host = %host.name,
                error = %err,
                "dispatch failed"
            );
            return Err(err);
        }
        check_status(&result)?;
        tracing::debug!(run_id = %self.run_id, step = %step.name, host = %host.name, "dispatch done");
        Ok(RunResult {
            output: result.output,
        })
    }
}

/// An agent that omits the status on completion reported success.
fn check_status(result: &TaskResult) -> Result<(), AppError> {
    match result.status {
        TaskStatus::Success | TaskStatus::Unset => Ok(()),
        _ => Err(AppError::new(
            ErrorCategory::ExecutionError,
            format!("task failed: {}", result.error),
        )
        .with_code("FF-DISPATCH-002")),
    }
}
