use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Counter and gauge names published by the runtime.
pub const STEP_STARTED_TOTAL: &str = "step_started_total";
pub const STEP_SUCCESS_TOTAL: &str = "step_success_total";
pub const STEP_FAILURE_TOTAL: &str = "step_failure_total";
pub const STEP_TIMEOUT_TOTAL: &str = "step_timeout_total";
pub const MINIONS_RUNNING: &str = "minions_running";
pub const STEPS_EXECUTING: &str = "steps_executing";

/// Running aggregate of step execution durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub count: u64,
    pub total_ms: u64,
    pub max_ms: u64,
}

impl DurationStats {
    fn record(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.count += 1;
        self.total_ms += ms;
        self.max_ms = self.max_ms.max(ms);
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms as f64 / self.count as f64
        }
    }
}

/// In-process telemetry sink for the minion runtime.
///
/// Counters are keyed per step; publication to an external backend is the
/// campaign layer's concern, this type only accumulates and snapshots.
#[derive(Debug, Default)]
pub struct Telemetry {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
    durations: Mutex<HashMap<String, DurationStats>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step_started(&self, step: &str) {
        self.incr(STEP_STARTED_TOTAL, step);
    }

    pub fn step_succeeded(&self, step: &str, duration: Duration) {
        self.incr(STEP_SUCCESS_TOTAL, step);
        self.durations
            .lock()
            .unwrap()
            .entry(step.to_string())
            .or_default()
            .record(duration);
    }

    pub fn step_failed(&self, step: &str) {
        self.incr(STEP_FAILURE_TOTAL, step);
    }

    pub fn step_timed_out(&self, step: &str) {
        self.incr(STEP_TIMEOUT_TOTAL, step);
    }

    pub fn minion_launched(&self) {
        self.adjust_gauge(MINIONS_RUNNING, 1);
    }

    pub fn minion_finished(&self) {
        self.adjust_gauge(MINIONS_RUNNING, -1);
    }

    pub fn step_execution_started(&self) {
        self.adjust_gauge(STEPS_EXECUTING, 1);
    }

    pub fn step_execution_finished(&self) {
        self.adjust_gauge(STEPS_EXECUTING, -1);
    }

    /// Current value of a per-step counter.
    pub fn counter(&self, name: &str, step: &str) -> u64 {
        self.counters
            .lock()
            .unwrap()
            .get(&metric_key(name, step))
            .copied()
            .unwrap_or(0)
    }

    pub fn timeouts(&self, step: &str) -> u64 {
        self.counter(STEP_TIMEOUT_TOTAL, step)
    }

    pub fn minions_running(&self) -> i64 {
        self.gauge(MINIONS_RUNNING)
    }

    pub fn steps_executing(&self) -> i64 {
        self.gauge(STEPS_EXECUTING)
    }

    fn gauge(&self, name: &str) -> i64 {
        self.gauges.lock().unwrap().get(name).copied().unwrap_or(0)
    }

    pub fn duration_stats(&self, step: &str) -> Option<DurationStats> {
        self.durations.lock().unwrap().get(step).copied()
    }

    /// Snapshot of all counters, for exporters and assertions.
    pub fn counters(&self) -> HashMap<String, u64> {
        self.counters.lock().unwrap().clone()
    }

    fn incr(&self, name: &str, step: &str) {
        *self
            .counters
            .lock()
            .unwrap()
            .entry(metric_key(name, step))
            .or_insert(0) += 1;
    }

    fn adjust_gauge(&self, name: &str, delta: i64) {
        *self
            .gauges
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert(0) += delta;
    }
}

fn metric_key(name: &str, step: &str) -> String {
    format!("{}{{step=\"{}\"}}", name, step)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_per_step() {
        let telemetry = Telemetry::new();
        telemetry.step_started("login");
        telemetry.step_started("login");
        telemetry.step_started("browse");
        telemetry.step_failed("login");

        assert_eq!(telemetry.counter(STEP_STARTED_TOTAL, "login"), 2);
        assert_eq!(telemetry.counter(STEP_STARTED_TOTAL, "browse"), 1);
        assert_eq!(telemetry.counter(STEP_FAILURE_TOTAL, "login"), 1);
        assert_eq!(telemetry.counter(STEP_FAILURE_TOTAL, "browse"), 0);
    }

    #[test]
    fn test_gauge_tracks_running_minions() {
        let telemetry = Telemetry::new();
        telemetry.minion_launched();
        telemetry.minion_launched();
        telemetry.minion_finished();
        assert_eq!(telemetry.minions_running(), 1);
    }

    #[test]
    fn test_gauge_tracks_executing_steps() {
        let telemetry = Telemetry::new();
        telemetry.step_execution_started();
        telemetry.step_execution_started();
        assert_eq!(telemetry.steps_executing(), 2);
        telemetry.step_execution_finished();
        telemetry.step_execution_finished();
        assert_eq!(telemetry.steps_executing(), 0);
    }

    #[test]
    fn test_duration_stats() {
        let telemetry = Telemetry::new();
        telemetry.step_succeeded("login", Duration::from_millis(10));
        telemetry.step_succeeded("login", Duration::from_millis(30));

        let stats = telemetry.duration_stats("login").unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_ms, 40);
        assert_eq!(stats.max_ms, 30);
        assert_eq!(stats.mean_ms(), 20.0);
    }
}
