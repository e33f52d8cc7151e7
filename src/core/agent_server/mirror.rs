use crate::core::dispatch::{Task, TaskStatus};
use crate::core::state::lifecycle::RunStatus;
use crate::core::state::model::{HostResult, RunState};
use crate::core::state::store::{is_already_exists, is_not_found, RunStateStore};
use crate::core::workflow::vars::Vars;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Agent-side record of task progress, keyed by the task's run id (or its own id when the
/// controller sent none).
///
/// Only runs this mirror created have their status driven by task results. A run found
/// already in the store belongs to a controller sharing it and gains step and host detail only.
pub(crate) struct RunMirror {
    store: Arc<dyn RunStateStore>,
    owned: Mutex<HashSet<String>>,
}

impl RunMirror {
    pub(crate) fn new(store: Arc<dyn RunStateStore>) -> Self {
        Self {
            store,
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn RunStateStore> {
        &self.store
    }

    /// Best effort: store errors are logged and swallowed.
    pub(crate) async fn record(&self, task: &Task, status: RunStatus, message: &str, output: Vars) {
        let run_id = match (task.run_id.trim(), task.id.trim()) {
            ("", "") => return,
            ("", id) | (id, _) => id.to_string(),
        };
        let mut owned = self.owned.lock().await;
        let now = Utc::now();
        let message = message.trim();

        let mut run = match self.store.get_run(&run_id).await {
            Ok(run) => run,
            Err(err) if is_not_found(&err) => {
                let mut run = RunState::new(&run_id, task.step.name.trim());
                run.status = RunStatus::Queued;
                run.started_at = Some(now);
                run.updated_at = Some(now);
                match self.store.create_run(run.clone()).await {
                    Ok(()) => {
                        owned.insert(run_id.clone());
                        run
                    }
                    Err(err) if is_already_exists(&err) => match self.store.get_run(&run_id).await {
                        Ok(run) => run,
                        Err(err) => {
                            tracing::warn!(run_id = %run_id, error = %err, "load run state failed");
                            return;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(run_id = %run_id, error = %err, "create run state failed");
                        return;
                    }
                }
            }
            Err(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "load run state failed");
                return;
            }
        };

        run.started_at.get_or_insert(now);
        run.upsert_step_start(&task.step.name, now);
        run.upsert_host_result(
            &task.step.name,
            HostResult {
                host: task.host.name.clone(),
                status,
                started_at: Some(now),
                finished_at: (status != RunStatus::Running).then_some(now),
                message: message.to_string(),
                output,
            },
        );
        if status != RunStatus::Running {
            run.upsert_step_finish(&task.step.name, status, message, now);
        }

        // One run id can span many tasks; a run already finished by an earlier task keeps its
        // terminal status and only gains step and host detail.
        if owned.contains(&run_id) && run.status.allows(status) {
            run.status = status;
            run.message = message.to_string();
            if status == RunStatus::Failed && !message.is_empty() {
                run.last_error = message.to_string();
            }
            if status.is_terminal() {
                run.finished_at = Some(now);
            }
        }
        run.updated_at = Some(now);
        if let Err(err) = self.store.update_run(run).await {
            tracing::warn!(run_id = %run_id, error = %err, "update run state failed");
        }
    }
}

/// Task statuses the agent does not recognise count as still running.
pub(crate) fn run_status_of(status: &TaskStatus) -> RunStatus {
    match status {
        TaskStatus::Success => RunStatus::Success,
        TaskStatus::Failed => RunStatus::Failed,
        TaskStatus::Canceled => RunStatus::Canceled,
        _ => RunStatus::Running,
    }
}
