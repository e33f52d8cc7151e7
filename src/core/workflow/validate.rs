#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::Workflow;
use std::collections::HashSet;

impl Workflow {
    /// Structural checks; every problem is collected rather than stopping at the first.
    pub fn validate(&self) -> Result<(), AppError> {
        let issues = self.validation_issues();
        if issues.is_empty() {
            return Ok(());
        }
        let mut err = AppError::new(
            ErrorCategory::ValidationError,
            format!("workflow validation failed: {}", issues.join("; ")),
        )
        .with_code("FF-VALIDATE-001");
        err.add_context("issues", &issues.len().to_string());
        Err(err)
    }

    /// Sorted list of human-readable validation problems.
    pub fn validation_issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.version.trim().is_empty() {
            issues.push("version is required".to_string());
        }
        if self.name.trim().is_empty() {
            issues.push("name is required".to_string());
        }
        if self.steps.is_empty() {
            issues.push("steps must not be empty".to_string());
        }

        let mode = self.plan.mode.trim();
        if !mode.is_empty() && mode != "manual-approve" && mode != "auto" {
            issues.push(format!(
                "plan.mode must be manual-approve or auto, got \"{}\"",
                mode
            ));
        }
        let strategy = self.plan.strategy.trim();
        if !strategy.is_empty() && strategy != "sequential" {
            issues.push(format!(
                "plan.strategy must be sequential, got \"{}\"",
                strategy
            ));
        }

        let mut handler_names = HashSet::new();
        for (i, handler) in self.handlers.iter().enumerate() {
            let name = handler.name.trim();
            if name.is_empty() {
                issues.push(format!("handlers[{}] name is required", i));
            } else if !handler_names.insert(name) {
                issues.push(format!("handler name \"{}\" is duplicated", name));
            }
            if handler.action.trim().is_empty() {
                issues.push(format!("handlers[{}] action is required", i));
            }
        }

        let mut step_names = HashSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name.trim();
            if name.is_empty() {
                issues.push(format!("steps[{}] name is required", i));
            } else if !step_names.insert(name) {
                issues.push(format!("step name \"{}\" is duplicated", name));
            }
            if step.action.trim().is_empty() {
                issues.push(format!("steps[{}] action is required", i));
            }
            for target in &step.notify {
                if !handler_names.contains(target.trim()) {
                    issues.push(format!(
                        "steps[{}] notify handler \"{}\" not found",
                        i, target
                    ));
                }
            }
        }

        issues.sort();
        issues.dedup();
        issues
    }
}
