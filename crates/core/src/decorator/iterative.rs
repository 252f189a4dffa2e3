use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::context::StepContext;
use crate::error::ExecutionError;
use crate::step::Step;
use crate::types::MinionId;

/// Executes the wrapped step a fixed number of times (or indefinitely),
/// refilling the single-buffered input slot before each round.
///
/// The context's tail flag is suppressed during intermediate rounds so
/// completion detection downstream sees exactly one terminal record per
/// minion, not one per iteration.
pub struct IterativeStep {
    inner: Arc<dyn Step>,
    /// `None` means iterate until the step stops itself or exhausts.
    iterations: Option<u64>,
    delay: Duration,
}

impl IterativeStep {
    pub fn new(inner: Arc<dyn Step>, iterations: u64, delay: Duration) -> Self {
        Self {
            inner,
            iterations: Some(iterations),
            delay,
        }
    }

    pub fn unbounded(inner: Arc<dyn Step>, delay: Duration) -> Self {
        Self {
            inner,
            iterations: None,
            delay,
        }
    }
}

#[async_trait]
impl Step for IterativeStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn start(&self) -> Result<(), ExecutionError> {
        self.inner.start().await
    }

    async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError> {
        // The real input is read once and replayed into the slot each round.
        let input = ctx.take_input().await;
        let outer_tail = ctx.tail();
        let mut round: u64 = 0;
        let mut result = Ok(());

        loop {
            if let Some(total) = self.iterations {
                if round >= total {
                    break;
                }
            }
            let last = self.iterations.map(|total| round + 1 == total).unwrap_or(false);

            ctx.set_iteration(round);
            // Intermediate rounds must not look like the minion's terminal
            // record; the outer tail value is restored on the last one.
            ctx.set_tail(if last { outer_tail } else { false });
            if let Some(value) = &input {
                ctx.refill_input(value.clone());
            }

            let outputs_before = ctx.outputs_produced();
            result = self.inner.execute(ctx).await;
            let inner_tail = ctx.tail();
            let produced = ctx.outputs_produced() > outputs_before;

            if result.is_err() || ctx.is_exhausted() {
                // Failure short-circuits the remaining rounds.
                debug!(step = self.name(), round, "iteration stopped by exhaustion");
                ctx.set_tail(outer_tail || inner_tail);
                break;
            }
            if inner_tail && !produced {
                // The step declared itself done with this minion.
                debug!(step = self.name(), round, "iteration terminated by step");
                ctx.set_tail(outer_tail || inner_tail);
                break;
            }
            if last {
                ctx.set_tail(outer_tail || inner_tail);
                break;
            }

            round += 1;
            // Guarantee a suspension point between rounds so a zero-delay
            // loop cannot starve other minions on the worker pool.
            if self.delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                tokio::time::sleep(self.delay).await;
            }
        }

        result
    }

    async fn complete(&self, minion: &MinionId) {
        self.inner.complete(minion).await;
    }

    async fn stop(&self) -> Result<(), ExecutionError> {
        self.inner.stop().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CampaignId, DagId, ScenarioId};
    use serde_json::{json, Value};
    use std::sync::Mutex;

    /// Records the tail flag and input seen at each execution.
    struct ProbeStep {
        name: String,
        rounds: Arc<Mutex<Vec<(u64, bool, Option<Value>)>>>,
        fail_on_round: Option<u64>,
        terminate_on_round: Option<u64>,
    }

    #[async_trait]
    impl Step for ProbeStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError> {
            let input = ctx.take_input().await;
            self.rounds
                .lock()
                .unwrap()
                .push((ctx.iteration(), ctx.tail(), input));

            if self.fail_on_round == Some(ctx.iteration()) {
                return Err(ExecutionError::failed(
                    self.name.clone(),
                    anyhow::anyhow!("round failed"),
                ));
            }
            if self.terminate_on_round == Some(ctx.iteration()) {
                // no output + tail set signals early termination
                ctx.set_tail(true);
                return Ok(());
            }
            let round = ctx.iteration();
            ctx.send_output(json!(round)).await;
            Ok(())
        }
    }

    fn probe(
        rounds: &Arc<Mutex<Vec<(u64, bool, Option<Value>)>>>,
        fail_on_round: Option<u64>,
        terminate_on_round: Option<u64>,
    ) -> Arc<dyn Step> {
        Arc::new(ProbeStep {
            name: "probed".to_string(),
            rounds: rounds.clone(),
            fail_on_round,
            terminate_on_round,
        })
    }

    fn tail_context() -> StepContext {
        let mut ctx = StepContext::root(
            MinionId::new(),
            CampaignId::new("campaign-1"),
            ScenarioId::new("scenario-1"),
            DagId::new("dag-1"),
            "probed",
        );
        ctx.set_tail(true);
        ctx
    }

    #[tokio::test]
    async fn test_runs_configured_number_of_rounds() {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let step = IterativeStep::new(probe(&rounds, None, None), 3, Duration::ZERO);

        let mut ctx = tail_context();
        // drain the output between rounds so the slot never blocks
        let mut output = ctx.take_output_receiver().unwrap();
        let drain = tokio::spawn(async move { while output.recv().await.is_some() {} });

        step.execute(&mut ctx).await.unwrap();
        ctx.close();
        drain.await.unwrap();

        let seen = rounds.lock().unwrap();
        // tail is suppressed on rounds 0 and 1, restored on the last
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (0, false, Some(Value::Null)));
        assert_eq!(seen[1], (1, false, Some(Value::Null)));
        assert_eq!(seen[2], (2, true, Some(Value::Null)));
        assert!(ctx.tail());
        assert!(!ctx.is_exhausted());
    }

    #[tokio::test]
    async fn test_failure_short_circuits_remaining_rounds() {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let step = IterativeStep::new(probe(&rounds, Some(1), None), 5, Duration::ZERO);

        let mut ctx = tail_context();
        let mut output = ctx.take_output_receiver().unwrap();
        let drain = tokio::spawn(async move { while output.recv().await.is_some() {} });

        let result = step.execute(&mut ctx).await;
        ctx.close();
        drain.await.unwrap();

        assert!(result.is_err());
        assert_eq!(rounds.lock().unwrap().len(), 2);
        assert!(ctx.tail());
    }

    #[tokio::test]
    async fn test_step_can_terminate_iteration_early() {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let step = IterativeStep::new(probe(&rounds, None, Some(1)), 10, Duration::ZERO);

        let mut ctx = tail_context();
        let mut output = ctx.take_output_receiver().unwrap();
        let drain = tokio::spawn(async move { while output.recv().await.is_some() {} });

        step.execute(&mut ctx).await.unwrap();
        ctx.close();
        drain.await.unwrap();

        assert_eq!(rounds.lock().unwrap().len(), 2);
        assert!(ctx.tail());
        assert!(!ctx.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_between_rounds() {
        let rounds = Arc::new(Mutex::new(Vec::new()));
        let step = IterativeStep::new(
            probe(&rounds, None, None),
            3,
            Duration::from_millis(100),
        );

        let mut ctx = tail_context();
        let mut output = ctx.take_output_receiver().unwrap();
        let drain = tokio::spawn(async move { while output.recv().await.is_some() {} });

        let started = tokio::time::Instant::now();
        step.execute(&mut ctx).await.unwrap();
        ctx.close();
        drain.await.unwrap();

        // two inter-round delays for three rounds
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert_eq!(rounds.lock().unwrap().len(), 3);
    }
}
