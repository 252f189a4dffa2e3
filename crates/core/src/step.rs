use async_trait::async_trait;

use crate::context::StepContext;
use crate::error::ExecutionError;
use crate::types::MinionId;

/// The processing capability the engine drives: consume one context,
/// optionally produce one output, optionally fail.
///
/// Concrete steps come from the scenario compilation layer; decorators wrap
/// an inner `Step` and expose the same surface, so the engine treats
/// decorated and undecorated steps identically.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name of the step, unique within its sub-graph.
    fn name(&self) -> &str;

    /// One-time setup before the step participates in a campaign.
    async fn start(&self) -> Result<(), ExecutionError> {
        Ok(())
    }

    /// Execute once for the given context.
    async fn execute(&self, ctx: &mut StepContext) -> Result<(), ExecutionError>;

    /// Signal that the given minion will send no further contexts through
    /// this step.
    async fn complete(&self, _minion: &MinionId) {}

    /// One-time teardown at the end of the campaign.
    async fn stop(&self) -> Result<(), ExecutionError> {
        Ok(())
    }
}
