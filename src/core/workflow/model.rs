use crate::core::workflow::vars::Vars;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Workflow document: inventory, variables, ordered steps and reusable handlers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub plan: PlanPolicy,
    #[serde(default)]
    pub vars: Vars,
    #[serde(default)]
    pub inventory: Inventory,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub handlers: Vec<Handler>,
    #[serde(default)]
    pub tests: Vec<TestSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanPolicy {
    /// `manual-approve` or `auto`.
    #[serde(default)]
    pub mode: String,
    /// Only `sequential` is supported.
    #[serde(default)]
    pub strategy: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub hosts: BTreeMap<String, Host>,
    #[serde(default)]
    pub groups: BTreeMap<String, Group>,
    #[serde(default)]
    pub vars: Vars,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Host {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub vars: Vars,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Group {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub vars: Vars,
}

/// One unit of declared work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Step {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "with")]
    pub args: Vars,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub when: String,
    #[serde(default, rename = "loop", skip_serializing_if = "Vec::is_empty")]
    pub loop_items: Vec<Value>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub timeout: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub must_vars: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expect_vars: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify: Vec<String>,
}

impl Step {
    pub fn new(name: impl Into<String>, action: impl Into<String>) -> Self {
        Step {
            name: name.into(),
            action: action.into(),
            ..Step::default()
        }
    }
}

/// Named step triggered through another step's `notify` list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Handler {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "with")]
    pub args: Vars,
    #[serde(default)]
    pub when: String,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub timeout: String,
}

impl Handler {
    /// The synthetic step a handler runs as.
    pub fn as_step(&self) -> Step {
        Step {
            name: self.name.clone(),
            action: self.action.clone(),
            args: self.args.clone(),
            retries: self.retries,
            timeout: self.timeout.clone(),
            ..Step::default()
        }
    }
}

/// Acceptance test declaration; loaded and validated only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestSpec {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: String,
    #[serde(default, alias = "with")]
    pub args: Vars,
}

/// A resolved target host.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HostSpec {
    pub name: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub vars: Vars,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl HostSpec {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        HostSpec {
            address: name.clone(),
            name,
            ..HostSpec::default()
        }
    }
}
