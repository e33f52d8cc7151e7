use crate::core::error::AppError;
use crate::core::modules::{
    invalid_args, rollback_unsupported, Module, ModuleFailure, ModuleRequest, ModuleResult,
};
use crate::core::workflow::vars::Vars;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

/// `wait.until`: sleeps for `args.duration` (`500ms`, `2s`, `1m 30s`).
#[derive(Debug, Default)]
pub struct WaitUntilModule;

impl WaitUntilModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Module for WaitUntilModule {
    async fn check(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        let mut diff = Vars::new();
        diff.insert("mode".into(), Value::String("until".into()));
        if let Some(duration) = request.arg_string("duration") {
            diff.insert("duration".into(), Value::String(duration));
        }
        Ok(ModuleResult {
            changed: false,
            diff,
            output: Vars::new(),
        })
    }

    async fn apply(&self, request: &ModuleRequest) -> Result<ModuleResult, ModuleFailure> {
        let duration = parse_duration(request)?;
        tokio::select! {
            _ = request.cancel.cancelled() => {
                Err(AppError::canceled(format!("step \"{}\"", request.step.name)).into())
            }
            _ = tokio::time::sleep(duration) => Ok(ModuleResult::default()),
        }
    }

    async fn rollback(&self, _request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        Err(rollback_unsupported("wait.until"))
    }
}

fn parse_duration(request: &ModuleRequest) -> Result<Duration, AppError> {
    let raw = request
        .arg_string("duration")
        .filter(|d| !d.trim().is_empty())
        .ok_or_else(|| invalid_args("wait.until requires args.duration"))?;
    humantime::parse_duration(raw.trim())
        .map_err(|err| invalid_args(format!("wait.until invalid duration: {}", err)))
}
