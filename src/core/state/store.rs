#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::state::lifecycle::{check_transition, RunStatus};
use crate::core::state::model::RunState;
use crate::core::state::run_id::validate_run_id;
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub const RUN_NOT_FOUND: &str = "FF-STATE-001";
pub const RUN_EXISTS: &str = "FF-STATE-002";

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Case-insensitive; empty matches every run.
    pub status: String,
    /// Zero means no limit.
    pub limit: usize,
}

/// Persistence for run state. Every returned run is an owned copy.
#[async_trait]
pub trait RunStateStore: Send + Sync {
    async fn create_run(&self, run: RunState) -> Result<(), AppError>;
    async fn update_run(&self, run: RunState) -> Result<(), AppError>;
    async fn get_run(&self, run_id: &str) -> Result<RunState, AppError>;
    async fn list_runs(&self, filter: &ListFilter) -> Result<Vec<RunState>, AppError>;
    /// Mark every `running` run as interrupted; returns how many were changed.
    async fn mark_interrupted_running(&self, reason: &str) -> Result<usize, AppError>;

    /// Whether state survives a process restart.
    fn is_durable(&self) -> bool {
        true
    }
}

pub fn run_not_found() -> AppError {
    AppError::new(ErrorCategory::StateError, "run state not found").with_code(RUN_NOT_FOUND)
}

pub fn run_exists() -> AppError {
    AppError::new(ErrorCategory::StateError, "run state already exists").with_code(RUN_EXISTS)
}

pub fn is_not_found(err: &AppError) -> bool {
    err.code == RUN_NOT_FOUND
}

pub fn is_already_exists(err: &AppError) -> bool {
    err.code == RUN_EXISTS
}

/// Defaults and checks applied before a run is first stored.
pub(crate) fn prepare_create(mut run: RunState, now: DateTime<Utc>) -> Result<RunState, AppError> {
    validate_run_id(&run.run_id)?;
    if run.status == RunStatus::Unset {
        run.status = RunStatus::Queued;
    }
    run.started_at.get_or_insert(now);
    run.updated_at.get_or_insert(now);
    if run.version < 1 {
        run.version = 1;
    }
    Ok(run)
}

/// Checks and stamps applied when `run` replaces the stored `prev`.
pub(crate) fn prepare_update(
    prev: &RunState,
    mut run: RunState,
    now: DateTime<Utc>,
) -> Result<RunState, AppError> {
    check_transition(prev.status, run.status)?;
    if run.started_at.is_none() {
        run.started_at = prev.started_at;
    }
    if run.status.is_terminal() && run.finished_at.is_none() {
        run.finished_at = Some(now);
    }
    run.updated_at = Some(now);
    if run.version <= prev.version {
        run.version = prev.version + 1;
    }
    Ok(run)
}

/// Flip a running run to interrupted. Returns false when the run was not running.
pub(crate) fn interrupt(run: &mut RunState, reason: &str, now: DateTime<Utc>) -> bool {
    if run.status != RunStatus::Running {
        return false;
    }
    run.status = RunStatus::Interrupted;
    run.interrupted_reason = reason.trim().to_string();
    if !run.interrupted_reason.is_empty() {
        run.message = run.interrupted_reason.clone();
    }
    run.finished_at = Some(now);
    run.updated_at = Some(now);
    run.version += 1;
    true
}

pub(crate) fn validate_update(run: &RunState) -> Result<(), AppError> {
    validate_run_id(&run.run_id)?;
    if run.status == RunStatus::Unset {
        return Err(AppError::new(
            ErrorCategory::StateError,
            "invalid run status \"\"",
        )
        .with_code("FF-STATE-010"));
    }
    Ok(())
}

/// Apply a list filter and order newest first.
pub(crate) fn select_runs<'a>(
    runs: impl Iterator<Item = &'a RunState>,
    filter: &ListFilter,
) -> Vec<RunState> {
    let wanted = filter.status.trim().to_lowercase();
    let mut selected: Vec<RunState> = runs
        .filter(|run| wanted.is_empty() || run.status.as_str() == wanted)
        .cloned()
        .collect();
    sort_runs(&mut selected);
    if filter.limit > 0 {
        selected.truncate(filter.limit);
    }
    selected
}

/// Newest `started_at` first, falling back to `updated_at` when a run never started.
pub fn sort_runs(runs: &mut [RunState]) {
    runs.sort_by(|a, b| {
        let key = |run: &RunState| run.started_at.or(run.updated_at);
        key(b).cmp(&key(a))
    });
}
