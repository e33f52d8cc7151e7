#![allow(clippy::result_large_err)]

//! Action modules: the pluggable units that do the actual work of a step on one host.

pub mod command;
pub mod env_set;
pub mod export;
pub mod output;
pub mod registry;
pub mod wait;

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::{HostSpec, Step};
use crate::core::workflow::vars::{value_to_string, Vars};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use output::{BoundedBuffer, OutputSink};
pub use registry::{register_builtins, ModuleRegistry, ModuleRegistryBuilder};

/// Everything a module needs to act on one host.
#[derive(Clone)]
pub struct ModuleRequest {
    pub step: Step,
    pub host: HostSpec,
    pub vars: Vars,
    pub stdout: Option<Arc<dyn OutputSink>>,
    pub stderr: Option<Arc<dyn OutputSink>>,
    pub cancel: CancellationToken,
}

impl ModuleRequest {
    pub fn new(step: Step, host: HostSpec, vars: Vars) -> Self {
        Self {
            step,
            host,
            vars,
            stdout: None,
            stderr: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_sinks(
        mut self,
        stdout: Option<Arc<dyn OutputSink>>,
        stderr: Option<Arc<dyn OutputSink>>,
    ) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// String view of a step argument; `null` counts as absent.
    pub fn arg_string(&self, key: &str) -> Option<String> {
        match self.step.args.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value_to_string(value)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModuleResult {
    pub changed: bool,
    pub diff: Vars,
    pub output: Vars,
}

/// A failed apply, keeping whatever output the module produced before failing.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ModuleFailure {
    pub output: Vars,
    #[source]
    pub error: AppError,
}

impl ModuleFailure {
    pub fn new(error: AppError, output: Vars) -> Self {
        Self { output, error }
    }
}

impl From<AppError> for ModuleFailure {
    fn from(error: AppError) -> Self {
        Self {
            output: Vars::new(),
            error,
        }
    }
}

/// Trait implemented by action modules.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Dry run: report what `apply` would change.
    async fn check(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError>;

    async fn apply(&self, request: &ModuleRequest) -> Result<ModuleResult, ModuleFailure>;

    async fn rollback(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError>;
}

pub(crate) fn rollback_unsupported(action: &str) -> AppError {
    AppError::new(
        ErrorCategory::ExecutionError,
        format!("{} rollback not supported", action),
    )
    .with_code("FF-MODULE-002")
}

pub(crate) fn invalid_args(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("FF-MODULE-001")
}
