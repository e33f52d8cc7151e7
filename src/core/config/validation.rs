#![allow(clippy::result_large_err)]

use super::FleetflowConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::net::SocketAddr;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate configuration rules
    pub fn validate(config: &FleetflowConfig) -> Result<(), AppError> {
        config.agent.dispatcher_settings()?;
        config.server.server_settings()?;
        config.notify.delay()?;

        let base_url = config.agent.base_url.trim();
        if !base_url.is_empty() {
            url::Url::parse(base_url).map_err(|e| {
                invalid(format!("agent.base_url is not a valid url: {}", e))
            })?;
        }

        if let Some(notify_url) = config.notify.url() {
            url::Url::parse(notify_url)
                .map_err(|e| invalid(format!("notify.url is not a valid url: {}", e)))?;
        }

        if config.state.file.as_os_str().is_empty() {
            return Err(invalid("state.file cannot be empty"));
        }

        config
            .server
            .bind
            .trim()
            .parse::<SocketAddr>()
            .map_err(|e| invalid(format!("server.bind is not a socket address: {}", e)))?;

        if config.server.max_body_bytes == 0 {
            return Err(invalid("server.max_body_bytes must be positive"));
        }
        if config.server.max_output_bytes == 0 {
            return Err(invalid("server.max_output_bytes must be positive"));
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("FF-CONFIG-002")
}
