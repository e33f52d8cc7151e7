#![allow(clippy::result_large_err)]

use crate::core::error::AppError;
use crate::core::state::model::RunState;
use crate::core::state::run_id::validate_run_id;
use crate::core::state::store::{
    interrupt, prepare_create, prepare_update, run_exists, run_not_found, select_runs,
    sort_runs, validate_update, ListFilter, RunStateStore,
};
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub runs: Vec<RunState>,
}

/// Run store backed by one JSON file, replaced atomically on every write.
#[derive(Debug)]
pub struct FileRunStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-modify-write under the store lock.
    fn with_state<T>(
        &self,
        mutate: impl FnOnce(&mut StateFile) -> Result<(T, bool), AppError>,
    ) -> Result<T, AppError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut state = self.load()?;
        let (value, dirty) = mutate(&mut state)?;
        if dirty {
            sort_runs(&mut state.runs);
            self.save(&mut state)?;
        }
        Ok(value)
    }

    /// A missing file is an empty state.
    pub fn load(&self) -> Result<StateFile, AppError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "state load missing");
                return Ok(StateFile::default());
            }
            Err(err) => {
                return Err(AppError::new(
                    ErrorCategory::IoError,
                    format!("failed to read state file {}: {}", self.path.display(), err),
                )
                .with_code("FF-STATE-020"))
            }
        };
        let state: StateFile = serde_json::from_slice(&raw).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to decode state file {}: {}", self.path.display(), err),
            )
            .with_code("FF-STATE-021")
        })?;
        tracing::debug!(path = %self.path.display(), runs = state.runs.len(), "state loaded");
        Ok(state)
    }

    fn save(&self, state: &mut StateFile) -> Result<(), AppError> {
        state.updated_at = Some(Utc::now());
        let payload = serde_json::to_vec_pretty(state).map_err(|err| {
            AppError::new(
                ErrorCategory::SerializationError,
                format!("failed to encode state file: {}", err),
            )
            .with_code("FF-STATE-022")
        })?;
        atomic_write(&self.path, &payload)?;
        tracing::debug!(path = %self.path.display(), runs = state.runs.len(), "state saved");
        Ok(())
    }
}

/// Write through a temp file in the target directory, then rename over the target.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), AppError> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_error = |what: &str, err: &dyn std::fmt::Display| {
        AppError::new(
            ErrorCategory::IoError,
            format!("failed to {} {}: {}", what, path.display(), err),
        )
        .with_code("FF-STATE-023")
    };
    fs::create_dir_all(&dir).map_err(|err| io_error("create directory for", &err))?;
    let mut tmp = tempfile::Builder::new()
        .prefix("state-")
        .suffix(".json")
        .tempfile_in(&dir)
        .map_err(|err| io_error("create temp file for", &err))?;
    tmp.write_all(data)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| io_error("write temp file for", &err))?;
    tmp.persist(path)
        .map_err(|err| io_error("persist", &err.error))?;
    Ok(())
}

#[async_trait]
impl RunStateStore for FileRunStore {
    async fn create_run(&self, run: RunState) -> Result<(), AppError> {
        let run = prepare_create(run, Utc::now())?;
        self.with_state(|state| {
            if state.runs.iter().any(|r| r.run_id == run.run_id) {
                return Err(run_exists());
            }
            state.runs.push(run);
            Ok(((), true))
        })
    }

    async fn update_run(&self, run: RunState) -> Result<(), AppError> {
        validate_update(&run)?;
        self.with_state(|state| {
            let slot = state
                .runs
                .iter_mut()
                .find(|r| r.run_id == run.run_id)
                .ok_or_else(run_not_found)?;
            *slot = prepare_update(slot, run, Utc::now())?;
            Ok(((), true))
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<RunState, AppError> {
        validate_run_id(run_id)?;
        self.with_state(|state| {
            let run = state
                .runs
                .iter()
                .find(|r| r.run_id == run_id)
                .cloned()
                .ok_or_else(run_not_found)?;
            Ok((run, false))
        })
    }

    async fn list_runs(&self, filter: &ListFilter) -> Result<Vec<RunState>, AppError> {
        self.with_state(|state| Ok((select_runs(state.runs.iter(), filter), false)))
    }

    async fn mark_interrupted_running(&self, reason: &str) -> Result<usize, AppError> {
        let now = Utc::now();
        self.with_state(|state| {
            let updated = state
                .runs
                .iter_mut()
                .map(|run| interrupt(run, reason, now))
                .filter(|changed| *changed)
                .count();
            Ok((updated, updated > 0))
        })
    }
}
