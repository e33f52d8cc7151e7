#![allow(clippy::result_large_err)]

//! Dispatch layer: run one step on one host, either in-process or through a remote agent.

pub mod agent;
pub mod local;

use crate::core::error::AppError;
use crate::core::workflow::model::{HostSpec, Step};
use crate::core::workflow::vars::Vars;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio_util::sync::CancellationToken;

pub use agent::{AgentDispatcher, AgentDispatcherSettings, OutputCallback};
pub use local::LocalDispatcher;

/// One dispatch unit: a step bound to a target and its merged variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub run_id: String,
    pub step: Step,
    pub host: HostSpec,
    #[serde(default)]
    pub vars: Vars,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TaskStatus {
    Success,
    Failed,
    Running,
    Canceled,
    /// Empty on the wire; agents that omit the status on completion mean success.
    #[default]
    Unset,
    Unknown(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Running => "running",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Unset => "",
            TaskStatus::Unknown(raw) => raw,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TaskStatus::Running)
    }
}

impl From<String> for TaskStatus {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "success" => TaskStatus::Success,
            "failed" => TaskStatus::Failed,
            "running" => TaskStatus::Running,
            "canceled" | "cancelled" => TaskStatus::Canceled,
            "" => TaskStatus::Unset,
            _ => TaskStatus::Unknown(raw),
        }
    }
}

impl From<TaskStatus> for String {
    fn from(status: TaskStatus) -> Self {
        status.as_str().to_string()
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(TaskStatus::from(raw.unwrap_or_default()))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    #[serde(default)]
    pub task_id: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub output: Vars,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TaskResult {
    pub fn new(task_id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            task_id: task_id.into(),
            status,
            ..TaskResult::default()
        }
    }
}

/// A failed dispatch together with the last result the dispatcher knew about.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct DispatchError {
    pub partial: TaskResult,
    #[source]
    pub error: AppError,
}

impl DispatchError {
    pub fn new(error: AppError, partial: TaskResult) -> Self {
        Self { partial, error }
    }
}

impl From<AppError> for DispatchError {
    fn from(error: AppError) -> Self {
        Self {
            partial: TaskResult::default(),
            error,
        }
    }
}

/// Executes one task for one host.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<TaskResult, DispatchError>;
}
