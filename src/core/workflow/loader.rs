#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::Workflow;
use std::path::Path;

/// Read and parse a workflow YAML document from disk.
pub fn load_file(path: &Path) -> Result<Workflow, AppError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to read workflow {}: {}", path.display(), err),
        )
        .with_code("FF-WORKFLOW-001")
    })?;
    load_str(&raw).map_err(|mut err| {
        err.add_context("path", &path.display().to_string());
        err
    })
}

pub fn load_str(raw: &str) -> Result<Workflow, AppError> {
    serde_yaml::from_str(raw).map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("invalid workflow document: {}", err),
        )
        .with_code("FF-WORKFLOW-002")
    })
}
