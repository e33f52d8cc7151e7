#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use rand::RngCore;
use regex::Regex;
use std::sync::OnceLock;

fn run_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._:-]{7,127}$").expect("run id pattern is valid")
    })
}

/// `run-<unix nanos>-<12 hex chars>`.
pub fn new_run_id() -> String {
    let mut suffix = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut suffix);
    let hex: String = suffix.iter().map(|b| format!("{:02x}", b)).collect();
    format!("run-{}-{}", unix_nanos(), hex)
}

pub(crate) fn unix_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_else(|| chrono::Utc::now().timestamp_micros().saturating_mul(1000))
}

pub fn validate_run_id(run_id: &str) -> Result<(), AppError> {
    let id = run_id.trim();
    if id.is_empty() {
        return Err(
            AppError::new(ErrorCategory::StateError, "run_id is required").with_code("FF-STATE-012"),
        );
    }
    if !run_id_pattern().is_match(id) {
        return Err(AppError::new(ErrorCategory::StateError, "run_id has invalid format")
            .with_code("FF-STATE-013"));
    }
    Ok(())
}
