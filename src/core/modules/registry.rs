#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::modules::command::{CommandModule, ShellModule};
use crate::core::modules::env_set::EnvSetModule;
use crate::core::modules::wait::WaitUntilModule;
use crate::core::modules::Module;
use crate::core::types::ErrorCategory;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builder used to register modules before execution.
#[derive(Default)]
pub struct ModuleRegistryBuilder {
    modules: BTreeMap<String, Arc<dyn Module>>,
}

impl ModuleRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: Module>(&mut self, action: &str, module: M) -> Result<&mut Self, AppError> {
        self.register_arc(action, Arc::new(module))
    }

    pub fn register_arc(
        &mut self,
        action: &str,
        module: Arc<dyn Module>,
    ) -> Result<&mut Self, AppError> {
        let key = action.trim();
        if key.is_empty() {
            return Err(
                AppError::new(ErrorCategory::ConfigurationError, "action is required")
                    .with_code("FF-REGISTRY-001"),
            );
        }
        if self.modules.contains_key(key) {
            return Err(AppError::new(
                ErrorCategory::ConfigurationError,
                format!("module \"{}\" already registered", key),
            )
            .with_code("FF-REGISTRY-002"));
        }
        self.modules.insert(key.to_string(), module);
        Ok(self)
    }

    pub fn build(self) -> ModuleRegistry {
        ModuleRegistry {
            inner: Arc::new(self.modules),
        }
    }
}

/// Immutable action → module table shared by dispatchers and the agent server.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    inner: Arc<BTreeMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn builder() -> ModuleRegistryBuilder {
        ModuleRegistryBuilder::new()
    }

    /// Registry with every built-in action.
    pub fn with_builtins() -> Result<Self, AppError> {
        let mut builder = ModuleRegistryBuilder::new();
        register_builtins(&mut builder)?;
        Ok(builder.build())
    }

    pub fn get(&self, action: &str) -> Option<Arc<dyn Module>> {
        self.inner.get(action.trim()).cloned()
    }

    /// Registered action names, sorted.
    pub fn actions(&self) -> Vec<String> {
        self.inner.keys().cloned().collect()
    }
}

/// Register built-in modules into the supplied builder.
pub fn register_builtins(builder: &mut ModuleRegistryBuilder) -> Result<(), AppError> {
    builder
        .register("cmd.run", CommandModule::new())?
        .register("shell.run", ShellModule::new())?
        .register("env.set", EnvSetModule::new())?
        .register("wait.until", WaitUntilModule::new())?;
    Ok(())
}
