use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::context::StepContext;
use crate::error::ExecutionError;
use crate::step::Step;
use crate::telemetry::Telemetry;
use crate::types::MinionId;

/// Bounds the wrapped step's execution with a deadline.
///
/// On elapse the pending execution is cancelled (dropped), the context is
/// marked exhausted, and a timeout-specific failure is returned to the
/// caller. Unlike ordinary step failures this one propagates, so a wrapping
/// retry policy can observe it distinctly.
pub struct TimeoutStep {
    inner: Arc<dyn Step>,
    timeout: Duration,
    telemetry: Arc<Telemetry>,
}

impl TimeoutStep {
    pub fn new(inner: Arc<dyn Step>, timeout: Duration, telemetry: Arc<Telemetry>) -> Self {
        Self {
            inner,
            timeout,
            telemetry,
        }
    }
}

#[async_trait]
impl Step for TimeoutStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self) -> Result<(), ExecutionError> {
        self.inner.start().await
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError> {
        match tokio::time::timeout(self.timeout, self.inner.execute(ctx)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    minion = %ctx.minion_id(),
                    step = self.name(),
                    after = ?self.timeout,
                    "step execution timed out"
                );
                self.telemetry.step_timed_out(self.name());
                ctx.set_exhausted();
                Err(ExecutionError::Timeout {
                    step: self.name().to_string(),
                    after: self.timeout,
                })
            }
        }
    }

    async fn complete(&self, minion: &MinionId) {
        self.inner.complete(minion).await;
    }

    async fn stop(&self) -> Result<(), ExecutionError> {
        self.inner.stop().await
    }
}
