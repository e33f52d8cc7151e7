#![allow(clippy::result_large_err)]

use crate::core::dispatch::{TaskResult, TaskStatus};
use crate::core::engine::recorder::Recorder;
use crate::core::error::AppError;
use crate::core::executor::{Observer, StepOutcome};
use crate::core::state::lifecycle::{check_transition, RunStatus};
use crate::core::state::model::{HostResult, RunState};
use crate::core::state::notifier::{RunStateCallback, RunStateNotifier};
use crate::core::state::run_id::{new_run_id, validate_run_id};
use crate::core::state::store::RunStateStore;
use crate::core::types::ErrorCategory;
use crate::core::workflow::model::{HostSpec, Step, Workflow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_NOTIFY_DELAY: Duration = Duration::from_millis(300);

#[derive(Clone, Default)]
pub struct TrackerOptions {
    /// Generated when blank.
    pub run_id: String,
    pub store: Option<Arc<dyn RunStateStore>>,
    pub notifier: Option<Arc<dyn RunStateNotifier>>,
    pub notify_retry: u32,
    /// Zero selects the default delay.
    pub notify_delay: Duration,
}

/// Keeps the authoritative working copy of one run and mirrors every change into the store and
/// the notifier.
#[derive(Clone)]
pub struct RunTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    run: Mutex<RunState>,
    created: AtomicBool,
    store: Arc<dyn RunStateStore>,
    notifier: Option<Arc<dyn RunStateNotifier>>,
    notify_retry: u32,
    notify_delay: Duration,
    /// Highest version written to the store.
    persisted: tokio::sync::Mutex<i64>,
}

impl RunTracker {
    pub fn new(workflow: &Workflow, options: TrackerOptions) -> Result<Self, AppError> {
        let run_id = match options.run_id.trim() {
            "" => new_run_id(),
            id => id.to_string(),
        };
        validate_run_id(&run_id)?;
        let store = options.store.ok_or_else(|| {
            AppError::new(ErrorCategory::ConfigurationError, "run state store is nil")
                .with_code("FF-STATE-030")
        })?;
        let notify_delay = if options.notify_delay.is_zero() {
            DEFAULT_NOTIFY_DELAY
        } else {
            options.notify_delay
        };

        let now = Utc::now();
        let mut run = RunState::new(run_id, workflow.name.trim());
        run.workflow_version = workflow.version.trim().to_string();
        run.status = RunStatus::Queued;
        run.version = 1;
        run.started_at = Some(now);
        run.updated_at = Some(now);

        Ok(Self {
            inner: Arc::new(TrackerInner {
                run: Mutex::new(run),
                created: AtomicBool::new(false),
                store,
                notifier: options.notifier,
                notify_retry: options.notify_retry,
                notify_delay,
                persisted: tokio::sync::Mutex::new(0),
            }),
        })
    }

    pub fn run_id(&self) -> String {
        self.inner.lock().run_id.clone()
    }

    pub fn snapshot(&self) -> RunState {
        self.inner.lock().clone()
    }

    /// Store the run as queued, then move it to running.
    pub async fn start(&self) -> Result<(), AppError> {
        let run = self.snapshot();
        self.inner.store.create_run(run.clone()).await?;
        self.inner.created.store(true, Ordering::SeqCst);
        *self.inner.persisted.lock().await = run.version;
        self.transition(RunStatus::Running, "", "").await
    }

    /// Terminal transition. `Unset` means success; the message falls back to the error text.
    pub async fn finish(
        &self,
        status: RunStatus,
        message: &str,
        error: Option<&AppError>,
    ) -> Result<(), AppError> {
        let status = match status {
            RunStatus::Unset => RunStatus::Success,
            other => other,
        };
        let error_text = error.map(|e| e.to_string()).unwrap_or_default();
        self.transition(status, message, &error_text).await
    }

    async fn transition(
        &self,
        next: RunStatus,
        message: &str,
        error_text: &str,
    ) -> Result<(), AppError> {
        let error_text = error_text.trim();
        let message = match message.trim() {
            "" => error_text,
            m => m,
        };
        let (snapshot, now) = {
            let mut run = self.inner.lock();
            check_transition(run.status, next)?;
            let now = Utc::now();
            run.status = next;
            run.message = message.to_string();
            run.last_error = error_text.to_string();
            if next.is_terminal() {
                run.finished_at = Some(now);
            }
            run.updated_at = Some(now);
            run.version += 1;
            (run.clone(), now)
        };

        if self.inner.created.swap(true, Ordering::SeqCst) {
            self.inner.persist(snapshot.clone()).await?;
        } else {
            self.inner.store.create_run(snapshot.clone()).await?;
            *self.inner.persisted.lock().await = snapshot.version;
        }

        tracing::debug!(
            run_id = %snapshot.run_id,
            status = %snapshot.status,
            version = snapshot.version,
            "run transition"
        );
        self.notify(callback(&snapshot, "", "", &snapshot.last_error, now));
        Ok(())
    }

    fn notify(&self, payload: RunStateCallback) {
        if self.inner.notifier.is_some() {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.deliver(payload).await });
        }
    }
}

impl TrackerInner {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `change` under the state lock, stamp it, and return the resulting snapshot.
    fn mutate(&self, change: impl FnOnce(&mut RunState, DateTime<Utc>)) -> (RunState, DateTime<Utc>) {
        let mut run = self.lock();
        let now = Utc::now();
        change(&mut run, now);
        run.updated_at = Some(now);
        run.version += 1;
        (run.clone(), now)
    }

    /// Writes are serialised; a snapshot older than the last persisted one is dropped.
    async fn persist(&self, snapshot: RunState) -> Result<(), AppError> {
        let mut persisted = self.persisted.lock().await;
        if snapshot.version <= *persisted {
            tracing::debug!(
                run_id = %snapshot.run_id,
                version = snapshot.version,
                persisted = *persisted,
                "run tracker skipped stale snapshot"
            );
            return Ok(());
        }
        let version = snapshot.version;
        self.store.update_run(snapshot).await?;
        *persisted = version;
        Ok(())
    }

    async fn deliver(self: Arc<Self>, payload: RunStateCallback) {
        let Some(notifier) = self.notifier.as_ref() else {
            return;
        };
        let mut attempt = 0;
        let failure = loop {
            match notifier.notify_run_state(&payload).await {
                Ok(()) => return,
                Err(err) if attempt < self.notify_retry => {
                    tracing::warn!(
                        run_id = %payload.run_id,
                        attempt = attempt + 1,
                        error = %err,
                        "run state notification failed, will retry"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.notify_delay).await;
                }
                Err(err) => break err,
            }
        };

        let (snapshot, _) = self.mutate(|run, _| run.last_notify_error = failure.to_string());
        if let Err(err) = self.persist(snapshot).await {
            tracing::warn!(
                run_id = %payload.run_id,
                error = %err,
                "run tracker notify error persist failed"
            );
        }
    }
}

fn callback(
    run: &RunState,
    step: &str,
    host: &str,
    error: &str,
    now: DateTime<Utc>,
) -> RunStateCallback {
    RunStateCallback {
        run_id: run.run_id.clone(),
        workflow_name: run.workflow_name.clone(),
        status: run.status.as_str().to_string(),
        step: step.to_string(),
        host: host.to_string(),
        timestamp: now,
        error: error.to_string(),
        version: run.version,
    }
}

/// Map a dispatch status onto the run lifecycle vocabulary.
pub(crate) fn host_status(status: &TaskStatus) -> RunStatus {
    match status {
        TaskStatus::Success | TaskStatus::Unset => RunStatus::Success,
        TaskStatus::Running => RunStatus::Running,
        TaskStatus::Canceled => RunStatus::Canceled,
        TaskStatus::Failed | TaskStatus::Unknown(_) => RunStatus::Failed,
    }
}

#[async_trait]
impl Observer for RunTracker {
    async fn step_start(&self, step: &Step, _targets: &[HostSpec]) -> Result<(), AppError> {
        let (snapshot, now) = self
            .inner
            .mutate(|run, now| run.upsert_step_start(&step.name, now));
        self.inner.persist(snapshot.clone()).await?;
        self.notify(callback(&snapshot, &step.name, "", "", now));
        Ok(())
    }

    async fn step_finish(&self, step: &Step, outcome: StepOutcome) -> Result<(), AppError> {
        let status = match outcome {
            StepOutcome::Success => RunStatus::Success,
            StepOutcome::Failed => RunStatus::Failed,
        };
        let (snapshot, now) = self
            .inner
            .mutate(|run, now| run.upsert_step_finish(&step.name, status, "", now));
        self.inner.persist(snapshot.clone()).await?;
        self.notify(callback(&snapshot, &step.name, "", "", now));
        Ok(())
    }
}

#[async_trait]
impl Recorder for RunTracker {
    async fn host_result(
        &self,
        step: &Step,
        host: &HostSpec,
        result: &TaskResult,
    ) -> Result<(), AppError> {
        let status = host_status(&result.status);
        let message = result.error.trim().to_string();
        let (snapshot, now) = self.inner.mutate(|run, now| {
            let entry = HostResult {
                host: host.name.clone(),
                status,
                started_at: Some(now),
                finished_at: (status != RunStatus::Running).then_some(now),
                message: message.clone(),
                output: result.output.clone(),
            };
            run.upsert_host_result(&step.name, entry);
            if status == RunStatus::Failed && !message.is_empty() {
                run.last_error = message.clone();
            }
        });
        self.inner.persist(snapshot.clone()).await?;
        self.notify(callback(&snapshot, &step.name, &host.name, &message, now));
        Ok(())
    }
}
