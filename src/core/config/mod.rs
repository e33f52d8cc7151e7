#![allow(clippy::result_large_err)]

use crate::core::agent_server::{
    AgentServerSettings, DEFAULT_MAX_BODY_BYTES, DEFAULT_MAX_OUTPUT_BYTES,
};
use crate::core::dispatch::AgentDispatcherSettings;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration loaded from fleetflow.toml
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FleetflowConfig {
    /// Remote agent dispatch
    #[serde(default)]
    pub agent: AgentConfig,

    /// Run state persistence
    #[serde(default)]
    pub state: StateConfig,

    /// Run state callbacks
    #[serde(default)]
    pub notify: NotifyConfig,

    /// Agent HTTP server
    #[serde(default)]
    pub server: ServerConfig,
}

/// Agent dispatcher configuration. Durations are humantime strings ("1s", "10m").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Used when a host has no address of its own
    #[serde(default)]
    pub base_url: String,

    #[serde(default)]
    pub token: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub heartbeat: bool,

    #[serde(default = "default_heartbeat_path")]
    pub heartbeat_path: String,

    #[serde(default = "default_status_path")]
    pub status_path: String,

    #[serde(default)]
    pub retry_max: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay: String,

    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout: String,

    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: String,

    #[serde(default = "default_async_timeout")]
    pub async_timeout: String,

    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,
}

/// Run state configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// JSON state file
    #[serde(default = "default_state_file")]
    pub file: PathBuf,
}

/// Run state webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default)]
    pub retry: u32,

    #[serde(default = "default_notify_delay")]
    pub delay: String,
}

/// Agent server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Empty disables authentication
    #[serde(default)]
    pub token: String,

    #[serde(default = "default_async_threshold")]
    pub async_threshold: String,

    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// How long finished tasks stay queryable through `/status`
    #[serde(default = "default_task_retention")]
    pub task_retention: String,
}

// Default functions
fn default_heartbeat_path() -> String {
    "/heartbeat".to_string()
}

fn default_status_path() -> String {
    "/status".to_string()
}

fn default_retry_delay() -> String {
    "1s".to_string()
}

fn default_dispatch_timeout() -> String {
    "30s".to_string()
}

fn default_heartbeat_timeout() -> String {
    "10s".to_string()
}

fn default_async_timeout() -> String {
    "10m".to_string()
}

fn default_poll_interval() -> String {
    "2s".to_string()
}

fn default_state_file() -> PathBuf {
    PathBuf::from(".fleetflow/state/runs.json")
}

fn default_notify_delay() -> String {
    "300ms".to_string()
}

fn default_task_retention() -> String {
    "1h".to_string()
}

fn default_bind() -> String {
    "127.0.0.1:7072".to_string()
}

fn default_async_threshold() -> String {
    "4s".to_string()
}

fn default_max_body_bytes() -> usize {
    DEFAULT_MAX_BODY_BYTES
}

fn default_max_output_bytes() -> usize {
    DEFAULT_MAX_OUTPUT_BYTES
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            base_url: String::new(),
            token: String::new(),
            headers: BTreeMap::new(),
            heartbeat: false,
            heartbeat_path: default_heartbeat_path(),
            status_path: default_status_path(),
            retry_max: 0,
            retry_delay: default_retry_delay(),
            dispatch_timeout: default_dispatch_timeout(),
            heartbeat_timeout: default_heartbeat_timeout(),
            async_timeout: default_async_timeout(),
            poll_interval: default_poll_interval(),
        }
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        StateConfig {
            file: default_state_file(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        NotifyConfig {
            url: None,
            headers: BTreeMap::new(),
            retry: 0,
            delay: default_notify_delay(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: default_bind(),
            token: String::new(),
            async_threshold: default_async_threshold(),
            max_body_bytes: default_max_body_bytes(),
            max_output_bytes: default_max_output_bytes(),
            task_retention: default_task_retention(),
        }
    }
}

/// Parse a humantime duration, naming the offending key on failure.
pub fn parse_duration(key: &str, raw: &str) -> Result<Duration, AppError> {
    humantime::parse_duration(raw.trim()).map_err(|e| {
        AppError::new(
            ErrorCategory::ConfigurationError,
            format!("invalid duration for {}: \"{}\" ({})", key, raw, e),
        )
        .with_code("FF-CONFIG-003")
    })
}

impl AgentConfig {
    pub fn dispatcher_settings(&self) -> Result<AgentDispatcherSettings, AppError> {
        Ok(AgentDispatcherSettings {
            base_url: self.base_url.trim().to_string(),
            headers: self.headers.clone(),
            token: self.token.trim().to_string(),
            heartbeat: self.heartbeat,
            heartbeat_path: self.heartbeat_path.clone(),
            status_path: self.status_path.clone(),
            retry_max: self.retry_max,
            retry_delay: parse_duration("agent.retry_delay", &self.retry_delay)?,
            dispatch_timeout: parse_duration("agent.dispatch_timeout", &self.dispatch_timeout)?,
            heartbeat_timeout: parse_duration("agent.heartbeat_timeout", &self.heartbeat_timeout)?,
            async_timeout: parse_duration("agent.async_timeout", &self.async_timeout)?,
            poll_interval: parse_duration("agent.poll_interval", &self.poll_interval)?,
        })
    }
}

impl NotifyConfig {
    pub fn delay(&self) -> Result<Duration, AppError> {
        parse_duration("notify.delay", &self.delay)
    }

    /// The configured url, if any and non-blank.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|u| !u.is_empty())
    }
}

impl ServerConfig {
    pub fn server_settings(&self) -> Result<AgentServerSettings, AppError> {
        Ok(AgentServerSettings {
            bind: self.bind.trim().to_string(),
            token: self.token.trim().to_string(),
            async_threshold: parse_duration("server.async_threshold", &self.async_threshold)?,
            max_body_bytes: self.max_body_bytes,
            max_output_bytes: self.max_output_bytes,
            task_retention: parse_duration("server.task_retention", &self.task_retention)?,
        })
    }
}


pub mod loader;
pub mod validation;

pub use loader::{ConfigLoader, CONFIG_FILE_NAME};
pub use validation::ConfigValidator;
