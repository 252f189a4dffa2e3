use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables of the minion runtime.
///
/// All fields have serde defaults so a partial config deserializes cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Period of the minion maintenance sweep that prunes finished
    /// bookkeeping tasks. Timing has no correctness impact.
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Deadline for a step's one-time start, distinct from per-execution
    /// timeouts.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_start_timeout_secs() -> u64 {
    30
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            maintenance_interval_secs: default_maintenance_interval_secs(),
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }
}
