#![allow(clippy::result_large_err)]

//! Engine: dry-run planning, tracked application of a workflow, and start-up reconciliation of
//! runs a previous process left behind.

pub mod planner;
pub mod recorder;
pub mod runner;
pub mod tracker;

use crate::core::dispatch::{Dispatcher, LocalDispatcher};
use crate::core::error::AppError;
use crate::core::executor::Executor;
use crate::core::modules::{ModuleRegistry, ModuleRequest};
use crate::core::state::lifecycle::RunStatus;
use crate::core::state::memory::InMemoryRunStore;
use crate::core::state::model::RunState;
use crate::core::state::notifier::RunStateNotifier;
use crate::core::state::run_id::unix_nanos;
use crate::core::state::store::RunStateStore;
use crate::core::types::ErrorCategory;
use crate::core::workflow::condition::evaluate;
use crate::core::workflow::inventory::{resolve_targets, target_names};
use crate::core::workflow::model::Workflow;
use crate::core::workflow::vars::merge_vars;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use planner::{diff, DiffEntry, Plan, ResourceChange, StepPlan};
pub use recorder::{MultiRecorder, Recorder};
pub use runner::DispatchRunner;
pub use tracker::{RunTracker, TrackerOptions, DEFAULT_NOTIFY_DELAY};

/// Per-run overrides for [`Engine::apply_with_run`]. Unset fields fall back to the engine.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub run_id: String,
    pub store: Option<Arc<dyn RunStateStore>>,
    pub notifier: Option<Arc<dyn RunStateNotifier>>,
    pub notify_retry: Option<u32>,
    pub notify_delay: Option<Duration>,
    /// Receives step and host callbacks alongside the run tracker.
    pub recorder: Option<Arc<dyn Recorder>>,
    /// Initial environment injected into every task.
    pub env: BTreeMap<String, String>,
}

/// A run that did not succeed, with the last known snapshot when the run got far enough to
/// have one.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct RunFailure {
    pub run: Option<RunState>,
    #[source]
    pub error: AppError,
}

impl RunFailure {
    fn before_start(error: AppError) -> Self {
        Self { run: None, error }
    }
}

pub struct Engine {
    registry: ModuleRegistry,
    dispatcher: Arc<dyn Dispatcher>,
    store: Arc<dyn RunStateStore>,
    notifier: Option<Arc<dyn RunStateNotifier>>,
    notify_retry: u32,
    notify_delay: Duration,
    non_durable_warning: Once,
}

impl Engine {
    /// Local dispatch over `registry` with an in-memory run store.
    pub fn new(registry: ModuleRegistry) -> Self {
        Self {
            dispatcher: Arc::new(LocalDispatcher::new(registry.clone())),
            registry,
            store: Arc::new(InMemoryRunStore::new()),
            notifier: None,
            notify_retry: 0,
            notify_delay: DEFAULT_NOTIFY_DELAY,
            non_durable_warning: Once::new(),
        }
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_notifier(
        mut self,
        notifier: Arc<dyn RunStateNotifier>,
        retry: u32,
        delay: Duration,
    ) -> Self {
        self.notifier = Some(notifier);
        self.notify_retry = retry;
        if !delay.is_zero() {
            self.notify_delay = delay;
        }
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn store(&self) -> Arc<dyn RunStateStore> {
        Arc::clone(&self.store)
    }

    /// Ask every module what it would change, without changing anything.
    pub async fn plan(&self, workflow: &Workflow) -> Result<Plan, AppError> {
        tracing::debug!(workflow = %workflow.name, steps = workflow.steps.len(), "engine plan start");
        let hosts = workflow.inventory.resolve_hosts();
        let mut plan = Plan {
            id: format!("plan-{}", unix_nanos()),
            workflow_name: workflow.name.clone(),
            created_at: Utc::now(),
            steps: Vec::new(),
        };

        for step in &workflow.steps {
            if !evaluate(&step.when, &workflow.vars)? {
                continue;
            }
            let targets = resolve_targets(step, &hosts, &workflow.inventory)?;
            let module = self.registry.get(&step.action).ok_or_else(|| {
                AppError::new(
                    ErrorCategory::ConfigurationError,
                    format!("module \"{}\" not registered", step.action.trim()),
                )
                .with_code("FF-DISPATCH-001")
            })?;

            let items: Vec<Option<&Value>> = if step.loop_items.is_empty() {
                vec![None]
            } else {
                step.loop_items.iter().map(Some).collect()
            };

            let mut step_plan = StepPlan {
                name: step.name.clone(),
                action: step.action.clone(),
                targets: target_names(&targets),
                changes: Vec::new(),
            };
            for item in items {
                for target in &targets {
                    let mut vars = merge_vars(&target.vars, &workflow.vars);
                    if let Some(item) = item {
                        vars.insert("item".to_string(), item.clone());
                    }
                    let request = ModuleRequest::new(step.clone(), target.clone(), vars);
                    let result = module.check(&request).await.map_err(|mut err| {
                        err.add_context("step", &step.name);
                        err.add_context("host", &target.name);
                        err
                    })?;
                    if result.changed {
                        step_plan.changes.push(ResourceChange {
                            resource_id: format!("{}:{}", step.name, target.name),
                            diff: planner::wrap_diff(&result.diff),
                        });
                    }
                }
            }
            plan.steps.push(step_plan);
        }

        tracing::debug!(workflow = %workflow.name, steps = plan.steps.len(), "engine plan done");
        Ok(plan)
    }

    pub async fn apply(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<RunState, RunFailure> {
        self.apply_with_run(workflow, RunOptions::default(), cancel)
            .await
    }

    /// Execute the workflow while tracking it as a run. The returned snapshot is the final
    /// state of the run either way.
    pub async fn apply_with_run(
        &self,
        workflow: &Workflow,
        options: RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunState, RunFailure> {
        tracing::debug!(workflow = %workflow.name, steps = workflow.steps.len(), "engine apply start");
        let store = options.store.unwrap_or_else(|| self.store());
        if !store.is_durable() {
            self.non_durable_warning.call_once(|| {
                tracing::warn!(
                    "run state store is in-memory only (non-durable); configure a state file for production"
                );
            });
        }

        let tracker = RunTracker::new(
            workflow,
            TrackerOptions {
                run_id: options.run_id,
                store: Some(store),
                notifier: options.notifier.or_else(|| self.notifier.clone()),
                notify_retry: options.notify_retry.unwrap_or(self.notify_retry),
                notify_delay: options.notify_delay.unwrap_or(self.notify_delay),
            },
        )
        .map_err(RunFailure::before_start)?;
        tracker.start().await.map_err(RunFailure::before_start)?;
        let run_id = tracker.run_id();

        let recorder = Arc::new(MultiRecorder::new([
            options.recorder,
            Some(Arc::new(tracker.clone()) as Arc<dyn Recorder>),
        ]));
        let runner = DispatchRunner::new(Arc::clone(&self.dispatcher), run_id.clone())
            .with_recorder(recorder.clone())
            .with_env(options.env);
        let executor = Executor::new(Arc::new(runner)).with_observer(recorder);

        match executor.run(workflow, cancel).await {
            Ok(()) => {
                if let Err(error) = tracker.finish(RunStatus::Success, "", None).await {
                    return Err(RunFailure {
                        run: Some(tracker.snapshot()),
                        error,
                    });
                }
                tracing::debug!(workflow = %workflow.name, run_id = %run_id, "engine apply done");
                Ok(tracker.snapshot())
            }
            Err(error) => {
                let status = if cancel.is_cancelled() {
                    RunStatus::Canceled
                } else {
                    RunStatus::Failed
                };
                if let Err(finish_error) = tracker
                    .finish(status, &error.to_string(), Some(&error))
                    .await
                {
                    let combined = AppError::new(
                        ErrorCategory::StateError,
                        format!(
                            "finalize run status: {} (execution error: {})",
                            finish_error, error
                        ),
                    )
                    .with_code("FF-STATE-031");
                    return Err(RunFailure {
                        run: Some(tracker.snapshot()),
                        error: combined,
                    });
                }
                tracing::debug!(
                    workflow = %workflow.name,
                    run_id = %run_id,
                    error = %error,
                    "engine apply failed"
                );
                Err(RunFailure {
                    run: Some(tracker.snapshot()),
                    error,
                })
            }
        }
    }

    /// Mark runs left `running` by a dead process as interrupted.
    pub async fn reconcile_running(
        &self,
        store: Option<&dyn RunStateStore>,
        reason: &str,
    ) -> Result<usize, AppError> {
        let store = match store {
            Some(store) => store,
            None => self.store.as_ref(),
        };
        let updated = store.mark_interrupted_running(reason).await?;
        if updated > 0 {
            tracing::info!(count = updated, reason = %reason, "reconciled interrupted runs");
        }
        Ok(updated)
    }
}
