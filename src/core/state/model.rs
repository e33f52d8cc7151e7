use crate::core::state::lifecycle::RunStatus;
use crate::core::workflow::vars::Vars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostResult {
    pub host: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vars::is_empty")]
    pub output: Vars,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hosts: BTreeMap<String, HostResult>,
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow_version: String,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub interrupted_reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_notify_error: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepState>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>, workflow_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_name: workflow_name.into(),
            ..RunState::default()
        }
    }

    pub fn step(&self, name: &str) -> Option<&StepState> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn upsert_step_start(&mut self, step_name: &str, now: DateTime<Utc>) {
        let step = self.ensure_step(step_name);
        step.started_at.get_or_insert(now);
        step.status = RunStatus::Running;
    }

    pub fn upsert_step_finish(
        &mut self,
        step_name: &str,
        status: RunStatus,
        message: &str,
        now: DateTime<Utc>,
    ) {
        let step = self.ensure_step(step_name);
        step.started_at.get_or_insert(now);
        step.status = status;
        step.message = message.to_string();
        step.finished_at = Some(now);
    }

    pub fn upsert_host_result(&mut self, step_name: &str, host: HostResult) {
        let step = self.ensure_step(step_name);
        step.hosts.insert(host.host.clone(), host);
    }

    /// Find a step entry, creating it on first touch.
    fn ensure_step(&mut self, name: &str) -> &mut StepState {
        let idx = match self.steps.iter().position(|s| s.name == name) {
            Some(idx) => idx,
            None => {
                self.steps.push(StepState {
                    name: name.to_string(),
                    ..StepState::default()
                });
                self.steps.len() - 1
            }
        };
        &mut self.steps[idx]
    }
}
