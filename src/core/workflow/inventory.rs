#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::{HostSpec, Inventory, Step};
use crate::core::workflow::vars::merge_vars;
use std::collections::BTreeMap;

impl Inventory {
    /// Flatten hosts and groups into resolved host specs keyed by host name.
    ///
    /// Hosts that only appear as group members are materialised with their name as address.
    /// Variables are layered inventory → groups (sorted by group name) → host.
    pub fn resolve_hosts(&self) -> BTreeMap<String, HostSpec> {
        let mut groups_by_host: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for (group_name, group) in &self.groups {
            for host_name in &group.hosts {
                groups_by_host
                    .entry(host_name.as_str())
                    .or_default()
                    .push(group_name.clone());
            }
        }

        let mut names: Vec<&str> = self.hosts.keys().map(String::as_str).collect();
        names.extend(groups_by_host.keys().copied());
        names.sort_unstable();
        names.dedup();

        let mut resolved = BTreeMap::new();
        for name in names {
            let mut group_names = groups_by_host.get(name).cloned().unwrap_or_default();
            group_names.sort();
            group_names.dedup();

            let mut vars = self.vars.clone();
            for group_name in &group_names {
                if let Some(group) = self.groups.get(group_name) {
                    vars = merge_vars(&vars, &group.vars);
                }
            }

            let mut address = name.to_string();
            if let Some(host) = self.hosts.get(name) {
                vars = merge_vars(&vars, &host.vars);
                if !host.address.is_empty() {
                    address = host.address.clone();
                }
            }

            resolved.insert(
                name.to_string(),
                HostSpec {
                    name: name.to_string(),
                    address,
                    vars,
                    groups: group_names,
                },
            );
        }
        resolved
    }
}

/// Select the hosts a step runs against, sorted by host name.
pub fn resolve_targets(
    step: &Step,
    hosts: &BTreeMap<String, HostSpec>,
    inventory: &Inventory,
) -> Result<Vec<HostSpec>, AppError> {
    if hosts.is_empty() {
        return Err(
            AppError::new(ErrorCategory::ResolutionError, "no hosts defined in inventory")
                .with_code("FF-TARGET-001"),
        );
    }
    if step.targets.is_empty() {
        return Ok(hosts.values().cloned().collect());
    }

    let mut selected: BTreeMap<&str, &HostSpec> = BTreeMap::new();
    for target in &step.targets {
        if let Some(host) = hosts.get(target) {
            selected.insert(host.name.as_str(), host);
            continue;
        }
        if let Some(group) = inventory.groups.get(target) {
            for member in &group.hosts {
                if let Some(host) = hosts.get(member) {
                    selected.insert(host.name.as_str(), host);
                }
            }
            continue;
        }
        return Err(AppError::new(
            ErrorCategory::ResolutionError,
            format!("unknown target \"{}\"", target),
        )
        .with_code("FF-TARGET-002"));
    }

    if selected.is_empty() {
        return Err(AppError::new(
            ErrorCategory::ResolutionError,
            format!("no targets resolved for step \"{}\"", step.name),
        )
        .with_code("FF-TARGET-003"));
    }
    Ok(selected.into_values().cloned().collect())
}

pub fn target_names(targets: &[HostSpec]) -> Vec<String> {
    targets.iter().map(|t| t.name.clone()).collect()
}
