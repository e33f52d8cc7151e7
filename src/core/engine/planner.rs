use crate::core::workflow::vars::Vars;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Dry-run result: what `apply` would change, step by step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub workflow_name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: Vec<StepPlan>,
}

impl Plan {
    pub fn change_count(&self) -> usize {
        self.steps.iter().map(|s| s.changes.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepPlan {
    pub name: String,
    pub action: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub changes: Vec<ResourceChange>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// `<step>:<host>`.
    pub resource_id: String,
    pub diff: BTreeMap<String, DiffEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    pub current: Value,
    pub desired: Value,
}

/// Key-wise difference between two maps; a key missing on one side compares as `null`.
pub fn diff(desired: &Vars, current: &Vars) -> BTreeMap<String, DiffEntry> {
    let keys: BTreeSet<&String> = desired.keys().chain(current.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let d = desired.get(key).cloned().unwrap_or(Value::Null);
            let c = current.get(key).cloned().unwrap_or(Value::Null);
            (d != c).then(|| {
                (
                    key.clone(),
                    DiffEntry {
                        current: c,
                        desired: d,
                    },
                )
            })
        })
        .collect()
}

/// A module's check diff has no observed state: every key is a pure desire.
pub(crate) fn wrap_diff(diff: &Vars) -> BTreeMap<String, DiffEntry> {
    diff.iter()
        .map(|(key, desired)| {
            (
                key.clone(),
                DiffEntry {
                    current: Value::Null,
                    desired: desired.clone(),
                },
            )
        })
        .collect()
}
