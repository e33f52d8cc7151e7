use crate::core::error::AppError;
use crate::core::state::model::RunState;
use crate::core::state::run_id::validate_run_id;
use crate::core::state::store::{
    interrupt, prepare_create, prepare_update, run_exists, run_not_found, select_runs,
    validate_update, ListFilter, RunStateStore,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Process-local run store; state is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<String, RunState>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RunState>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunState>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RunStateStore for InMemoryRunStore {
    async fn create_run(&self, run: RunState) -> Result<(), AppError> {
        let run = prepare_create(run, Utc::now())?;
        let mut runs = self.write();
        if runs.contains_key(&run.run_id) {
            return Err(run_exists());
        }
        runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn update_run(&self, run: RunState) -> Result<(), AppError> {
        validate_update(&run)?;
        let mut runs = self.write();
        let prev = runs.get(&run.run_id).ok_or_else(run_not_found)?;
        let run = prepare_update(prev, run, Utc::now())?;
        runs.insert(run.run_id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<RunState, AppError> {
        validate_run_id(run_id)?;
        self.read().get(run_id).cloned().ok_or_else(run_not_found)
    }

    async fn list_runs(&self, filter: &ListFilter) -> Result<Vec<RunState>, AppError> {
        Ok(select_runs(self.read().values(), filter))
    }

    async fn mark_interrupted_running(&self, reason: &str) -> Result<usize, AppError> {
        let now = Utc::now();
        let mut runs = self.write();
        let updated = runs
            .values_mut()
            .map(|run| interrupt(run, reason, now))
            .filter(|changed| *changed)
            .count();
        Ok(updated)
    }

    fn is_durable(&self) -> bool {
        false
    }
}
