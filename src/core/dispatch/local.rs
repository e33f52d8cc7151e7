use crate::core::dispatch::{DispatchError, Dispatcher, Task, TaskResult, TaskStatus};
use crate::core::error::AppError;
use crate::core::modules::{ModuleRegistry, ModuleRequest};
use crate::core::types::ErrorCategory;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Runs modules in-process.
#[derive(Clone)]
pub struct LocalDispatcher {
    registry: ModuleRegistry,
}

impl LocalDispatcher {
    pub fn new(registry: ModuleRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Dispatcher for LocalDispatcher {
    async fn dispatch(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let module = self.registry.get(&task.step.action).ok_or_else(|| {
            AppError::new(
                ErrorCategory::ConfigurationError,
                format!("module \"{}\" not registered", task.step.action.trim()),
            )
            .with_code("FF-DISPATCH-001")
        })?;

        let task_id = task.id;
        let request = ModuleRequest::new(task.step, task.host, task.vars).with_cancel(cancel);
        match module.apply(&request).await {
            Ok(result) => Ok(TaskResult {
                output: result.output,
                ..TaskResult::new(task_id, TaskStatus::Success)
            }),
            Err(failure) => {
                let partial = TaskResult {
                    output: failure.output,
                    error: failure.error.message.clone(),
                    ..TaskResult::new(task_id, TaskStatus::Failed)
                };
                Err(DispatchError::new(failure.error, partial))
            }
        }
    }
}
