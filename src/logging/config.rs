use crate::core::config::loader::CONFIG_FILE_NAME;
use crate::logging::layers::console::{ConsoleOutput, LogFormat};
use crate::Result;
use anyhow::{anyhow, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing_subscriber::filter::Directive;

const DEFAULT_LEVEL: &str = "info";

/// Resolved logging configuration after reading the config file and env overrides.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
    pub default_level: String,
    pub enable_file: bool,
    pub console_output: Option<ConsoleOutput>,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            default_level: DEFAULT_LEVEL.to_string(),
            enable_file: true,
            console_output: None,
            format: LogFormat::Text,
        }
    }
}

impl LoggingConfig {
    /// Load configuration with deterministic precedence: defaults, the `[logging]` section of
    /// `fleetflow.toml`, then `FLEETFLOW_LOG_*` env overrides.
    pub fn load(workspace_root: Option<&Path>) -> Result<Self> {
        let mut config = LoggingConfig::default();
        if let Some(workspace) = workspace_root {
            if let Some(section) = Self::load_from_file(&workspace.join(CONFIG_FILE_NAME))? {
                config.apply(section);
            }
        }
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Option<TomlLoggingSection>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read logging config {}", path.display()))?;
        let parsed: TomlLogging = toml::from_str(&content)
            .with_context(|| format!("failed to parse logging config {}", path.display()))?;
        Ok(parsed.logging)
    }

    fn apply(&mut self, logging: TomlLoggingSection) {
        if let Some(log_dir) = logging.log_dir {
            self.log_dir = Some(PathBuf::from(log_dir));
        }
        if let Some(default_level) = logging.default_level {
            self.default_level = default_level;
        }
        if let Some(enable_file) = logging.enable_file {
            self.enable_file = enable_file;
        }
        if let Some(console_output) = logging.console_output {
            self.console_output = Some(console_output);
        }
        if let Some(format) = logging.format {
            self.format = format;
        }
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(level) = non_blank_var("FLEETFLOW_LOG_LEVEL") {
            self.default_level = level;
        }
        if let Some(dir) = non_blank_var("FLEETFLOW_LOG_DIR") {
            self.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(enable_file) = non_blank_var("FLEETFLOW_LOG_FILE") {
            self.enable_file = enable_file
                .parse::<bool>()
                .map_err(|_| anyhow!("FLEETFLOW_LOG_FILE must be true or false"))?;
        }
        if let Some(console) = non_blank_var("FLEETFLOW_LOG_CONSOLE") {
            self.console_output = Some(ConsoleOutput::from_str(&console).map_err(|e| anyhow!(e))?);
        }
        if let Some(format) = non_blank_var("FLEETFLOW_LOG_FORMAT") {
            self.format = LogFormat::from_str(&format).map_err(|e| anyhow!(e))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for directive in self.default_level.split(',').filter(|d| !d.trim().is_empty()) {
            Directive::from_str(directive.trim())
                .map_err(|_| anyhow!("logging.default_level must be a valid tracing directive"))?;
        }
        if let Some(dir) = &self.log_dir {
            if dir.as_os_str().is_empty() {
                return Err(anyhow!("logging.log_dir cannot be empty"));
            }
        }
        Ok(())
    }
}

fn non_blank_var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Deserialize)]
struct TomlLogging {
    logging: Option<TomlLoggingSection>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingSection {
    log_dir: Option<String>,
    default_level: Option<String>,
    enable_file: Option<bool>,
    #[serde(default)]
    console_output: Option<ConsoleOutput>,
    format: Option<LogFormat>,
}
