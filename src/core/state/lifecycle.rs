#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Run lifecycle. `Unset` is the state of a run that has never been stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    #[serde(rename = "")]
    Unset,
    Queued,
    Running,
    Success,
    Failed,
    Canceled,
    Interrupted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Unset => "",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Canceled => "canceled",
            RunStatus::Interrupted => "interrupted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failed | RunStatus::Canceled | RunStatus::Interrupted
        )
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn allows(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (_, Unset) => false,
            (Unset, Queued | Running) => true,
            (Queued, Queued | Running | Failed | Canceled | Interrupted) => true,
            (Running, Running | Success | Failed | Canceled | Interrupted) => true,
            (from, to) if from.is_terminal() => *from == to,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = AppError;

    /// Trimmed, case-insensitive. The empty string parses as `Unset`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "" => Ok(RunStatus::Unset),
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            "canceled" => Ok(RunStatus::Canceled),
            "interrupted" => Ok(RunStatus::Interrupted),
            _ => Err(invalid_status(raw)),
        }
    }
}

fn invalid_status(raw: &str) -> AppError {
    AppError::new(
        ErrorCategory::StateError,
        format!("invalid run status \"{}\"", raw),
    )
    .with_code("FF-STATE-010")
}

/// Parse a status that a run may be stored in; the unset state is rejected.
pub fn validate_run_status(raw: &str) -> Result<RunStatus, AppError> {
    match raw.parse::<RunStatus>()? {
        RunStatus::Unset => Err(invalid_status(raw)),
        status => Ok(status),
    }
}

pub fn validate_run_transition(from: &str, to: &str) -> Result<RunStatus, AppError> {
    let next = validate_run_status(to)?;
    let current = from
        .parse::<RunStatus>()
        .map_err(|_| invalid_transition(from, to))?;
    if !current.allows(next) {
        return Err(invalid_transition(from, to));
    }
    Ok(next)
}

pub(crate) fn check_transition(from: RunStatus, to: RunStatus) -> Result<(), AppError> {
    if to == RunStatus::Unset {
        return Err(invalid_status(to.as_str()));
    }
    if from.allows(to) {
        Ok(())
    } else {
        Err(invalid_transition(from.as_str(), to.as_str()))
    }
}

fn invalid_transition(from: &str, to: &str) -> AppError {
    AppError::new(
        ErrorCategory::StateError,
        format!("invalid run transition from \"{}\" to \"{}\"", from, to),
    )
    .with_code("FF-STATE-011")
}
