use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use crate::context::StepContext;
use crate::error::ExecutionError;
use crate::events::{Event, EventSink};
use crate::step::Step;
use crate::types::{CampaignId, MinionId};

/// Observes the wrapped step's lifetime (start, many executions, stop) and
/// publishes per-execution events plus a final summary.
///
/// Pure pass-through from the engine's perspective: execution results are
/// forwarded untouched. Only a start failure is fatal, it is reported and
/// rethrown, ending the step's participation in the campaign.
pub struct ReportingStep {
    inner: Arc<dyn Step>,
    campaign_id: CampaignId,
    events: Arc<dyn EventSink>,
    start_timeout: Duration,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl ReportingStep {
    pub fn new(
        inner: Arc<dyn Step>,
        campaign_id: CampaignId,
        events: Arc<dyn EventSink>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            campaign_id,
            events,
            start_timeout,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    async fn publish(&self, event: Event) {
        if let Err(err) = self.events.publish(event).await {
            warn!(step = self.name(), error = %err, "failed to publish step event");
        }
    }
}

#[async_trait]
impl Step for ReportingStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    /// Step start is bounded by its own deadline, distinct from the
    /// per-execution timeout.
    async fn start(&self) -> Result<(), ExecutionError> {
        let cause = match tokio::time::timeout(self.start_timeout, self.inner.start()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("start timed out after {:?}", self.start_timeout),
        };
        error!(step = self.name(), error = %cause, "step failed to start");
        self.publish(Event::step_start_failed(
            self.campaign_id.clone(),
            self.name(),
            cause.clone(),
        ))
        .await;
        Err(ExecutionError::StartFailed {
            step: self.name().to_string(),
            cause,
        })
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError> {
        self.publish(Event::step_started(ctx)).await;
        let started = Instant::now();

        let result = self.inner.execute(ctx).await;
        match &result {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::SeqCst);
                self.publish(Event::step_completed(
                    ctx,
                    started.elapsed().as_millis() as u64,
                ))
                .await;
            }
            // Cancellation is not a step failure and must not be counted.
            Err(ExecutionError::Cancelled) => {}
            Err(ExecutionError::Timeout { after, .. }) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                let after_ms = after.as_millis() as u64;
                self.publish(Event::step_timed_out(ctx, after_ms)).await;
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                self.publish(Event::step_failed(ctx, err.to_string())).await;
            }
        }
        result
    }

    async fn complete(&self, minion: &MinionId) {
        self.inner.complete(minion).await;
    }

    /// Forwards a final summary of the step's lifetime before tearing down.
    async fn stop(&self) -> Result<(), ExecutionError> {
        self.publish(Event::step_summary(
            self.campaign_id.clone(),
            self.name(),
            self.successes(),
            self.failures(),
        ))
        .await;
        self.inner.stop().await
    }
}
