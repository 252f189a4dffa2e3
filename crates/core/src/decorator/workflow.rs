use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::context::StepContext;
use crate::error::ExecutionError;
use crate::step::Step;
use crate::sync::InFlightGauge;
use crate::types::MinionId;

/// Tracks concurrent in-flight executions of the wrapped step per minion.
///
/// A single minion may have several branches inside the same step at once
/// (via fan-out); `complete` must not reach the wrapped step while any
/// sibling branch is still executing.
pub struct WorkflowStep {
    inner: Arc<dyn Step>,
    in_flight: InFlightGauge,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WorkflowStep {
    pub fn new(inner: Arc<dyn Step>) -> Self {
        Self {
            inner,
            in_flight: InFlightGauge::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn in_flight(&self, minion: &MinionId) -> u64 {
        self.in_flight.in_flight(minion)
    }
}

#[async_trait]
impl Step for WorkflowStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Idempotent: several call sites may start the same step.
    async fn start(&self) -> Result<(), ExecutionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.start().await
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError> {
        // The guard releases the slot even when this task is cancelled.
        let _guard = self.in_flight.enter(ctx.minion_id());
        self.inner.execute(ctx).await
    }

    /// Suspends until every in-flight execution for this minion has ended,
    /// then forwards the completion signal.
    async fn complete(&self, minion: &MinionId) {
        self.in_flight.wait_idle(minion).await;
        debug!(minion = %minion, step = self.name(), "minion drained from step");
        self.inner.complete(minion).await;
    }

    async fn stop(&self) -> Result<(), ExecutionError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stop().await
    }
}
