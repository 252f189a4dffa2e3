use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::error::StepFault;
use crate::types::{CampaignId, DagId, MinionId, ScenarioId};

/// A single-buffered value slot.
///
/// Wraps a capacity-1 channel: at most one value is parked between a producer
/// and a consumer. Closing drops the sender so a pending `recv` observes end
/// of stream instead of suspending forever.
#[derive(Debug)]
struct Slot {
    tx: Option<mpsc::Sender<Value>>,
    rx: Option<mpsc::Receiver<Value>>,
    sends: u64,
}

impl Slot {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Some(tx),
            rx: Some(rx),
            sends: 0,
        }
    }

    /// A slot with `value` already queued for the consumer.
    fn preloaded(value: Value) -> Self {
        let mut slot = Self::new();
        slot.fill(value);
        slot
    }

    /// A slot that will never carry a value: `recv` returns `None` immediately.
    fn empty() -> Self {
        let mut slot = Self::new();
        slot.tx = None;
        slot
    }

    /// Queue a value without suspending. A no-op when the slot is closed or
    /// already holds an unread value.
    fn fill(&mut self, value: Value) {
        if let Some(tx) = &self.tx {
            if tx.try_send(value).is_ok() {
                self.sends += 1;
            }
        }
    }

    async fn send(&mut self, value: Value) -> bool {
        match &self.tx {
            Some(tx) => {
                if tx.send(value).await.is_ok() {
                    self.sends += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    async fn recv(&mut self) -> Option<Value> {
        match &mut self.rx {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    fn take_receiver(&mut self) -> Option<mpsc::Receiver<Value>> {
        self.rx.take()
    }

    fn close(&mut self) {
        self.tx = None;
        if let Some(rx) = &mut self.rx {
            rx.close();
        }
    }
}

/// The data envelope that flows between a step and its successors for one
/// minion and one execution attempt.
///
/// Contexts are never written by more than one task; sharing across a fork is
/// limited to the fault list and the exhausted flag (the fan-out reader of
/// the same context needs to observe exhaustion after the step finished).
#[derive(Debug)]
pub struct StepContext {
    minion_id: MinionId,
    campaign_id: CampaignId,
    scenario_id: ScenarioId,
    dag_id: DagId,
    step: String,
    created_at: DateTime<Utc>,
    iteration: u64,
    input: Slot,
    output: Slot,
    exhausted: Arc<AtomicBool>,
    tail: bool,
    faults: Arc<Mutex<Vec<StepFault>>>,
}

impl StepContext {
    /// Context for the root step of a sub-graph, with an empty input already
    /// queued so the first step's read does not suspend.
    pub fn root(
        minion_id: MinionId,
        campaign_id: CampaignId,
        scenario_id: ScenarioId,
        dag_id: DagId,
        step: impl Into<String>,
    ) -> Self {
        Self {
            minion_id,
            campaign_id,
            scenario_id,
            dag_id,
            step: step.into(),
            created_at: Utc::now(),
            iteration: 0,
            input: Slot::preloaded(Value::Null),
            output: Slot::new(),
            exhausted: Arc::new(AtomicBool::new(false)),
            tail: false,
            faults: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn minion_id(&self) -> MinionId {
        self.minion_id
    }

    pub fn campaign_id(&self) -> &CampaignId {
        &self.campaign_id
    }

    pub fn scenario_id(&self) -> &ScenarioId {
        &self.scenario_id
    }

    pub fn dag_id(&self) -> &DagId {
        &self.dag_id
    }

    /// Name of the step this context is destined for.
    pub fn step(&self) -> &str {
        &self.step
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    pub fn set_iteration(&mut self, iteration: u64) {
        self.iteration = iteration;
    }

    /// Read the input value. At most one read per step execution; an
    /// input-less context returns `None` without suspending.
    pub async fn take_input(&mut self) -> Option<Value> {
        self.input.recv().await
    }

    /// Re-queue an input value for the next iteration of an iterative step.
    pub fn refill_input(&mut self, value: Value) {
        self.input.fill(value);
    }

    /// Publish the step's output. At most one write per step execution.
    pub async fn send_output(&mut self, value: Value) -> bool {
        self.output.send(value).await
    }

    /// How many output values have been published through this context.
    pub fn outputs_produced(&self) -> u64 {
        self.output.sends
    }

    /// Detach the output consumer half, for the engine's fan-out reader.
    pub fn take_output_receiver(&mut self) -> Option<mpsc::Receiver<Value>> {
        self.output.take_receiver()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    pub fn set_exhausted(&self) {
        self.exhausted.store(true, Ordering::SeqCst);
    }

    /// Only recovery steps may clear exhaustion once set.
    pub fn clear_exhausted(&self) {
        self.exhausted.store(false, Ordering::SeqCst);
    }

    /// Whether this is the last record this minion will produce for a branch.
    pub fn tail(&self) -> bool {
        self.tail
    }

    pub fn set_tail(&mut self, tail: bool) {
        self.tail = tail;
    }

    /// Record a failure against this branch and mark the context exhausted.
    pub fn push_fault(&self, fault: StepFault) {
        self.faults.lock().unwrap().push(fault);
        self.set_exhausted();
    }

    /// Snapshot of the faults accumulated along this branch.
    pub fn faults(&self) -> Vec<StepFault> {
        self.faults.lock().unwrap().clone()
    }

    /// The ids shared with every context forked from this one.
    pub fn seed(&self) -> ForkSeed {
        ForkSeed {
            minion_id: self.minion_id,
            campaign_id: self.campaign_id.clone(),
            scenario_id: self.scenario_id.clone(),
            dag_id: self.dag_id.clone(),
            exhausted: self.exhausted.clone(),
            faults: self.faults.clone(),
        }
    }

    /// Close both channels. Called once the step has finished, whether or not
    /// it produced output.
    pub fn close(&mut self) {
        self.input.close();
        self.output.close();
    }

    /// Flat key-value tags identifying this context, for event publication.
    pub fn tags(&self) -> HashMap<String, String> {
        HashMap::from([
            ("campaign".to_string(), self.campaign_id.to_string()),
            ("scenario".to_string(), self.scenario_id.to_string()),
            ("dag".to_string(), self.dag_id.to_string()),
            ("step".to_string(), self.step.clone()),
            ("minion".to_string(), self.minion_id.to_string()),
        ])
    }
}

/// The shared portion of a context, captured before a step executes so the
/// fan-out reader can derive one context per outgoing edge afterwards.
#[derive(Debug, Clone)]
pub struct ForkSeed {
    minion_id: MinionId,
    campaign_id: CampaignId,
    scenario_id: ScenarioId,
    dag_id: DagId,
    exhausted: Arc<AtomicBool>,
    faults: Arc<Mutex<Vec<StepFault>>>,
}

impl ForkSeed {
    pub fn minion_id(&self) -> MinionId {
        self.minion_id
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Derive a context for one outgoing edge. `input == None` produces an
    /// input-less context whose read returns immediately.
    pub fn fork(&self, step: impl Into<String>, input: Option<Value>) -> StepContext {
        StepContext {
            minion_id: self.minion_id,
            campaign_id: self.campaign_id.clone(),
            scenario_id: self.scenario_id.clone(),
            dag_id: self.dag_id.clone(),
            step: step.into(),
            created_at: Utc::now(),
            iteration: 0,
            input: match input {
                Some(value) => Slot::preloaded(value),
                None => Slot::empty(),
            },
            output: Slot::new(),
            exhausted: Arc::new(AtomicBool::new(self.is_exhausted())),
            tail: false,
            faults: self.faults.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_context(step: &str) -> StepContext {
        StepContext::root(
            MinionId::new(),
            CampaignId::new("campaign-1"),
            ScenarioId::new("scenario-1"),
            DagId::new("dag-1"),
            step,
        )
    }

    #[tokio::test]
    async fn test_root_input_is_queued() {
        let mut ctx = test_context("first");
        assert_eq!(ctx.take_input().await, Some(Value::Null));
    }

    #[tokio::test]
    async fn test_inputless_fork_reads_none() {
        let ctx = test_context("parent");
        let mut fork = ctx.seed().fork("handler", None);
        assert_eq!(fork.take_input().await, None);
    }

    #[tokio::test]
    async fn test_forks_are_independent() {
        let mut parent = test_context("parent");
        parent.send_output(json!({"token": "y"})).await;

        let seed = parent.seed();
        let mut fork_a = seed.fork("a", Some(json!({"token": "y"})));
        let mut fork_b = seed.fork("b", Some(json!({"token": "y"})));

        assert_eq!(fork_a.take_input().await, Some(json!({"token": "y"})));
        assert_eq!(fork_b.take_input().await, Some(json!({"token": "y"})));

        fork_a.set_exhausted();
        fork_a.set_tail(true);
        assert!(!fork_b.is_exhausted());
        assert!(!fork_b.tail());
        assert_eq!(fork_a.step(), "a");
        assert_eq!(fork_b.step(), "b");
    }

    #[tokio::test]
    async fn test_fork_shares_fault_list() {
        let parent = test_context("parent");
        let fork = parent.seed().fork("next", None);
        fork.push_fault(StepFault::new("parent", "broke"));
        assert_eq!(parent.faults().len(), 1);
        // exhaustion does not travel backwards through the fork
        assert!(!parent.is_exhausted());
        assert!(fork.is_exhausted());
    }

    #[tokio::test]
    async fn test_exhausted_fork_inherits_flag_value() {
        let parent = test_context("parent");
        parent.set_exhausted();
        let fork = parent.seed().fork("handler", None);
        assert!(fork.is_exhausted());
    }

    #[tokio::test]
    async fn test_closed_output_ends_reader() {
        let mut ctx = test_context("step");
        let mut rx = ctx.take_output_receiver().unwrap();
        ctx.send_output(json!(1)).await;
        ctx.close();
        assert_eq!(rx.recv().await, Some(json!(1)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_refill_supports_repeated_reads() {
        let mut ctx = test_context("looped");
        assert_eq!(ctx.take_input().await, Some(Value::Null));
        ctx.refill_input(json!(7));
        assert_eq!(ctx.take_input().await, Some(json!(7)));
    }

    #[test]
    fn test_tags_identify_the_context() {
        let ctx = test_context("login");
        let tags = ctx.tags();
        assert_eq!(tags["campaign"], "campaign-1");
        assert_eq!(tags["scenario"], "scenario-1");
        assert_eq!(tags["dag"], "dag-1");
        assert_eq!(tags["step"], "login");
        assert_eq!(tags["minion"], ctx.minion_id().to_string());
    }
}
