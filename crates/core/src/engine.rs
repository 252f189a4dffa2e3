use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{ForkSeed, StepContext};
use crate::error::{ExecutionError, StepFault};
use crate::events::{Event, EventSink, NullEventSink};
use crate::graph::{StepGraph, StepNode};
use crate::minion::Minion;
use crate::telemetry::Telemetry;
use crate::types::MinionId;

/// Campaign-side collaborator watching for end-of-campaign conditions.
#[async_trait]
pub trait CampaignMonitor: Send + Sync {
    /// A minion finished every task attached to it.
    async fn minion_completed(&self, minion: &MinionId);

    /// A minion's context reached a terminal (dead-end) step of a sub-graph.
    async fn dead_end_reached(&self, minion: &MinionId, step: &str);
}

/// Monitor that ignores every notification.
pub struct NoopMonitor;

#[async_trait]
impl CampaignMonitor for NoopMonitor {
    async fn minion_completed(&self, _minion: &MinionId) {}
    async fn dead_end_reached(&self, _minion: &MinionId, _step: &str) {}
}

/// Drives minions through a step graph.
///
/// Every task the engine spawns is attached to the owning minion, so a single
/// `cancel` reaches all descendants and completion is observable through the
/// minion's latch alone.
#[derive(Clone)]
pub struct Runner {
    telemetry: Arc<Telemetry>,
    events: Arc<dyn EventSink>,
    monitor: Arc<dyn CampaignMonitor>,
}

impl Runner {
    pub fn new(
        telemetry: Arc<Telemetry>,
        events: Arc<dyn EventSink>,
        monitor: Arc<dyn CampaignMonitor>,
    ) -> Self {
        Self {
            telemetry,
            events,
            monitor,
        }
    }

    /// A runner wired to no-op collaborators.
    pub fn detached() -> Self {
        Self::new(
            Arc::new(Telemetry::new()),
            Arc::new(NullEventSink),
            Arc::new(NoopMonitor),
        )
    }

    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Execute the graph for one minion: build the root context with an empty
    /// input already queued and launch the root step.
    pub async fn run(&self, minion: Arc<Minion>, graph: Arc<StepGraph>) {
        let root = graph.root().clone();
        let ctx = StepContext::root(
            minion.id(),
            minion.campaign_id().clone(),
            graph.scenario_id().clone(),
            minion.dag_id().clone(),
            root.name(),
        );
        self.launch(minion.clone(), graph, root, ctx).await;
        minion.wait_started().await;
    }

    /// Start the minion (no-op if already started) and attach a task
    /// executing `node` with `ctx`, recursively fanning out to successors.
    pub async fn launch(
        &self,
        minion: Arc<Minion>,
        graph: Arc<StepGraph>,
        node: StepNode,
        ctx: StepContext,
    ) {
        minion.start();
        self.telemetry.minion_launched();
        info!(
            minion = %minion.id(),
            campaign = %minion.campaign_id(),
            step = node.name(),
            "launching minion"
        );

        {
            let telemetry = self.telemetry.clone();
            minion.on_complete(move || telemetry.minion_finished());
        }

        // Completion job: drives join() so hooks run even when nobody else
        // joins this minion, and notifies the campaign side afterwards.
        {
            let minion = minion.clone();
            let monitor = self.monitor.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                minion.join().await;
                if !minion.is_cancelled() {
                    monitor.minion_completed(&minion.id()).await;
                    publish(
                        &events,
                        Event::minion_completed(
                            minion.campaign_id().clone(),
                            minion.id(),
                            minion.dag_id().clone(),
                        ),
                    )
                    .await;
                    info!(minion = %minion.id(), "minion completed");
                }
            });
        }

        let task = {
            let runner = self.clone();
            let minion = minion.clone();
            tokio::spawn(async move { runner.execute_step(minion, graph, node, ctx).await })
        };
        minion.attach(task).await;
    }

    /// Execute one step and fan out to its successors.
    ///
    /// The fan-out reader runs as its own attached task so downstream edges
    /// execute concurrently with no ordering guarantee between siblings,
    /// while still being reachable from the minion's cancellation.
    async fn execute_step(
        &self,
        minion: Arc<Minion>,
        graph: Arc<StepGraph>,
        node: StepNode,
        mut ctx: StepContext,
    ) {
        let successors = graph.successors(node.name());
        let terminal = successors.is_empty();

        if terminal {
            // No further forking: this context is the branch's last record.
            ctx.set_tail(true);
        } else if let Some(output) = ctx.take_output_receiver() {
            let seed = ctx.seed();
            let reader = {
                let runner = self.clone();
                let minion = minion.clone();
                let graph = graph.clone();
                tokio::spawn(async move {
                    runner.fan_out(minion, graph, successors, seed, output).await;
                })
            };
            minion.attach(reader).await;
        }

        self.execute_single_step(&node, &mut ctx).await;
        ctx.close();

        if terminal && ctx.tail() {
            self.monitor.dead_end_reached(&minion.id(), node.name()).await;
            publish(
                &self.events,
                Event::dead_end_reached(
                    minion.campaign_id().clone(),
                    minion.id(),
                    node.name(),
                ),
            )
            .await;
        }
    }

    /// Read everything the upstream step produced and fork one context per
    /// outgoing edge and value. An exhausted context that produced nothing is
    /// still forwarded, input-less, to every error-processing successor so
    /// error handlers run exactly once per edge.
    async fn fan_out(
        &self,
        minion: Arc<Minion>,
        graph: Arc<StepGraph>,
        successors: Vec<StepNode>,
        seed: ForkSeed,
        mut output: mpsc::Receiver<serde_json::Value>,
    ) {
        let mut produced = false;
        while let Some(value) = output.recv().await {
            produced = true;
            for succ in &successors {
                let fork = seed.fork(succ.name(), Some(value.clone()));
                self.attach_execution(&minion, &graph, succ.clone(), fork).await;
            }
        }

        if !produced && seed.is_exhausted() {
            for succ in successors.iter().filter(|s| s.error_handler) {
                debug!(
                    minion = %minion.id(),
                    step = succ.name(),
                    "forwarding exhausted context to error handler"
                );
                let fork = seed.fork(succ.name(), None);
                self.attach_execution(&minion, &graph, succ.clone(), fork).await;
            }
        }
    }

    async fn attach_execution(
        &self,
        minion: &Arc<Minion>,
        graph: &Arc<StepGraph>,
        node: StepNode,
        ctx: StepContext,
    ) {
        let task = tokio::spawn(self.clone().execute_step_boxed(
            minion.clone(),
            graph.clone(),
            node,
            ctx,
        ));
        minion.attach(task).await;
    }

    // Boxed indirection to break the recursive future type between
    // execute_step and fan_out.
    fn execute_step_boxed(
        self,
        minion: Arc<Minion>,
        graph: Arc<StepGraph>,
        node: StepNode,
        ctx: StepContext,
    ) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move { self.execute_step(minion, graph, node, ctx).await })
    }

    /// Execute the step itself, absorbing any failure into the context so
    /// sibling branches are unaffected.
    async fn execute_single_step(&self, node: &StepNode, ctx: &mut StepContext) {
        // Exhausted contexts bypass ordinary steps but must still reach
        // error handlers.
        if ctx.is_exhausted() && !node.error_handler {
            debug!(
                minion = %ctx.minion_id(),
                step = node.name(),
                "skipping step for exhausted context"
            );
            return;
        }

        self.telemetry.step_started(node.name());
        self.telemetry.step_execution_started();
        let started = Instant::now();

        let result = node.step.execute(ctx).await;
        self.telemetry.step_execution_finished();

        match result {
            Ok(()) => {
                self.telemetry.step_succeeded(node.name(), started.elapsed());
                debug!(
                    minion = %ctx.minion_id(),
                    step = node.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "step completed"
                );
            }
            Err(ExecutionError::Cancelled) => {
                // Cancellation is never reported as a step failure.
                debug!(minion = %ctx.minion_id(), step = node.name(), "step cancelled");
            }
            Err(err) => {
                warn!(
                    minion = %ctx.minion_id(),
                    step = node.name(),
                    error = %err,
                    "step failed"
                );
                ctx.push_fault(StepFault::from_error(node.name(), &err));
                self.telemetry.step_failed(node.name());
            }
        }
    }
}

async fn publish(sink: &Arc<dyn EventSink>, event: Event) {
    if let Err(err) = sink.publish(event).await {
        warn!(error = %err, "failed to publish runtime event");
    }
}
