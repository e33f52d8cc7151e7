#![allow(clippy::result_large_err)]

use super::FleetflowConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::env;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "fleetflow.toml";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load config from workspace root (workspace/fleetflow.toml).
    /// A missing file means defaults; environment variables are applied last.
    pub fn load_from_workspace(workspace_path: &Path) -> Result<FleetflowConfig, AppError> {
        let config_path = workspace_path.join(CONFIG_FILE_NAME);
        let mut config = Self::load_from_file(&config_path)?.unwrap_or_default();
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Load config from a specific file path; an explicitly named file must exist.
    pub fn load_from_path(path: &Path) -> Result<FleetflowConfig, AppError> {
        let mut config = Self::load_from_file(path)?.ok_or_else(|| {
            AppError::new(
                ErrorCategory::ConfigurationError,
                format!("config file {} not found", path.display()),
            )
            .with_code("FF-CONFIG-001")
        })?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    /// Returns Ok(None) if the file doesn't exist
    pub fn load_from_file(path: &Path) -> Result<Option<FleetflowConfig>, AppError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to read config file {}: {}", path.display(), e),
            )
            .with_code("FF-CONFIG-001")
        })?;

        let config: FleetflowConfig = toml::from_str(&content).map_err(|e| {
            AppError::new(
                ErrorCategory::ValidationError,
                format!("failed to parse config file {}: {}", path.display(), e),
            )
            .with_code("FF-CONFIG-001")
        })?;

        tracing::debug!(path = %path.display(), "config loaded");
        Ok(Some(config))
    }

    /// Environment variables take precedence over config file values
    fn apply_env_overrides(config: &mut FleetflowConfig) {
        // Agent overrides
        if let Ok(base_url) = env::var("FLEETFLOW_AGENT_BASE_URL") {
            config.agent.base_url = base_url;
        }

        if let Ok(token) = env::var("FLEETFLOW_AGENT_TOKEN") {
            config.agent.token = token;
        }

        if let Ok(heartbeat) = env::var("FLEETFLOW_AGENT_HEARTBEAT") {
            if let Ok(heartbeat) = heartbeat.parse::<bool>() {
                config.agent.heartbeat = heartbeat;
            }
        }

        if let Ok(retry_max) = env::var("FLEETFLOW_AGENT_RETRY_MAX") {
            if let Ok(retry_max) = retry_max.parse::<u32>() {
                config.agent.retry_max = retry_max;
            }
        }

        // State overrides
        if let Ok(file) = env::var("FLEETFLOW_STATE_FILE") {
            config.state.file = PathBuf::from(file);
        }

        // Notify overrides
        if let Ok(url) = env::var("FLEETFLOW_NOTIFY_URL") {
            config.notify.url = Some(url);
        }

        if let Ok(retry) = env::var("FLEETFLOW_NOTIFY_RETRY") {
            if let Ok(retry) = retry.parse::<u32>() {
                config.notify.retry = retry;
            }
        }

        // Server overrides
        if let Ok(bind) = env::var("FLEETFLOW_SERVER_BIND") {
            config.server.bind = bind;
        }

        if let Ok(token) = env::var("FLEETFLOW_SERVER_TOKEN") {
            config.server.token = token;
        }
    }

    /// Get documentation for supported environment variables
    pub fn env_var_documentation() -> &'static [&'static str] {
        &[
            "FLEETFLOW_AGENT_BASE_URL - Override the agent base url used for hosts without an address",
            "FLEETFLOW_AGENT_TOKEN - Override the agent bearer token",
            "FLEETFLOW_AGENT_HEARTBEAT - Probe the agent before each dispatch attempt (true/false)",
            "FLEETFLOW_AGENT_RETRY_MAX - Override dispatch retry count (default: 0)",
            "FLEETFLOW_STATE_FILE - Override the run state file (default: .fleetflow/state/runs.json)",
            "FLEETFLOW_NOTIFY_URL - Post run state callbacks to this url",
            "FLEETFLOW_NOTIFY_RETRY - Override callback retry count (default: 0)",
            "FLEETFLOW_SERVER_BIND - Override the agent server bind address (default: 127.0.0.1:7072)",
            "FLEETFLOW_SERVER_TOKEN - Override the agent server token",
        ]
    }
}
