use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Failure surface of step execution.
///
/// Ordinary step failures are absorbed by the engine into the owning
/// [`StepContext`](crate::context::StepContext); only `Timeout` and
/// `Cancelled` are meaningful to callers above the decorator chain.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The step's own logic failed.
    #[error("step '{step}' failed: {cause}")]
    Failed { step: String, cause: anyhow::Error },

    /// The step did not finish within its configured deadline.
    #[error("step '{step}' timed out after {after:?}")]
    Timeout { step: String, after: Duration },

    /// The step did not come up within its start deadline, or start itself failed.
    /// Fatal for the step's participation in the campaign.
    #[error("step '{step}' failed to start: {cause}")]
    StartFailed { step: String, cause: String },

    /// The owning minion (or the task running the step) was cancelled.
    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn failed(step: impl Into<String>, cause: impl Into<anyhow::Error>) -> Self {
        Self::Failed {
            step: step.into(),
            cause: cause.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// A failure recorded against a context, kept until the end of the branch.
///
/// Pairs the failing step's name with the rendered cause so downstream
/// error-processing steps can inspect what went wrong upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFault {
    pub step: String,
    pub message: String,
}

impl StepFault {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }

    pub fn from_error(step: impl Into<String>, error: &ExecutionError) -> Self {
        Self::new(step, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinguishable() {
        let err = ExecutionError::Timeout {
            step: "login".to_string(),
            after: Duration::from_secs(5),
        };
        assert!(err.is_timeout());
        assert!(!err.is_cancelled());

        let err = ExecutionError::failed("login", anyhow::anyhow!("connection refused"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_fault_keeps_step_name() {
        let err = ExecutionError::failed("checkout", anyhow::anyhow!("boom"));
        let fault = StepFault::from_error("checkout", &err);
        assert_eq!(fault.step, "checkout");
        assert!(fault.message.contains("boom"));
    }
}
