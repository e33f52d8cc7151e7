use crate::core::error::AppError;
use crate::core::modules::{
    invalid_args, rollback_unsupported, Module, ModuleFailure, ModuleRequest, ModuleResult,
};
use crate::core::workflow::render::render_string;
use crate::core::workflow::vars::{string_pairs, Vars};
use async_trait::async_trait;
use serde_json::Value;

/// `env.set`: publishes `args.env` as `output.env` so later steps see it in their environment.
#[derive(Debug, Default)]
pub struct EnvSetModule;

impl EnvSetModule {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Module for EnvSetModule {
    async fn check(&self, request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        let env = read_env(request)?;
        let mut diff = Vars::new();
        diff.insert("env".into(), Value::Object(env.clone()));
        let mut output = Vars::new();
        output.insert("env".into(), Value::Object(env));
        Ok(ModuleResult {
            changed: true,
            diff,
            output,
        })
    }

    async fn apply(&self, request: &ModuleRequest) -> Result<ModuleResult, ModuleFailure> {
        let env = read_env(request)?;
        let mut output = Vars::new();
        output.insert("env".into(), Value::Object(env));
        Ok(ModuleResult {
            changed: true,
            diff: Vars::new(),
            output,
        })
    }

    async fn rollback(&self, _request: &ModuleRequest) -> Result<ModuleResult, AppError> {
        Err(rollback_unsupported("env.set"))
    }
}

fn read_env(request: &ModuleRequest) -> Result<Vars, AppError> {
    let raw = request
        .step
        .args
        .get("env")
        .ok_or_else(|| invalid_args("env.set requires args.env"))?;
    if !raw.is_object() {
        return Err(invalid_args("env.set requires args.env to be a map"));
    }
    let pairs = string_pairs(raw);
    if pairs.is_empty() {
        return Err(invalid_args("env.set requires at least one env entry"));
    }
    let mut env = Vars::new();
    for (key, value) in pairs {
        if key.trim().is_empty() {
            return Err(invalid_args("env.set env key cannot be empty"));
        }
        env.insert(key, Value::String(render_string(&value, &request.vars)));
    }
    Ok(env)
}
