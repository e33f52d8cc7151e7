use crate::core::dispatch::TaskResult;
use crate::core::error::AppError;
use crate::core::executor::{Observer, StepOutcome};
use crate::core::workflow::model::{HostSpec, Step};
use async_trait::async_trait;
use std::sync::Arc;

/// An executor observer that also sees every per-host dispatch result.
#[async_trait]
pub trait Recorder: Observer {
    async fn host_result(
        &self,
        step: &Step,
        host: &HostSpec,
        result: &TaskResult,
    ) -> Result<(), AppError>;
}

/// Fans every callback out to each recorder in order; the first error wins.
#[derive(Clone, Default)]
pub struct MultiRecorder {
    recorders: Vec<Arc<dyn Recorder>>,
}

impl MultiRecorder {
    pub fn new(recorders: impl IntoIterator<Item = Option<Arc<dyn Recorder>>>) -> Self {
        Self {
            recorders: recorders.into_iter().flatten().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.recorders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }
}

#[async_trait]
impl Observer for MultiRecorder {
    async fn step_start(&self, step: &Step, targets: &[HostSpec]) -> Result<(), AppError> {
        for recorder in &self.recorders {
            recorder.step_start(step, targets).await?;
        }
        Ok(())
    }

    async fn step_finish(&self, step: &Step, outcome: StepOutcome) -> Result<(), AppError> {
        for recorder in &self.recorders {
            recorder.step_finish(step, outcome).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Recorder for MultiRecorder {
    async fn host_result(
        &self,
        step: &Step,
        host: &HostSpec,
        result: &TaskResult,
    ) -> Result<(), AppError> {
        for recorder in &self.recorders {
            recorder.host_result(step, host, result).await?;
        }
        Ok(())
    }
}
