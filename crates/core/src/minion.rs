use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::sync::CountLatch;
use crate::types::{CampaignId, DagId, MinionId, MinionStatus};

type CompletionHook = Box<dyn FnOnce() + Send + 'static>;

/// Task bookkeeping, always mutated under a single lock so `cancel` cannot
/// race `attach` between the cancelled check and the registration.
struct MinionState {
    cancelled: bool,
    completed: bool,
    next_job: u64,
    /// Abort handles of in-flight step jobs, by job id.
    step_jobs: HashMap<u64, AbortHandle>,
    /// Bookkeeping tasks watching step jobs end. Pruned by maintenance.
    completion_jobs: HashMap<u64, JoinHandle<()>>,
    executing_steps: u64,
    hooks: Vec<CompletionHook>,
}

/// The actor representing one virtual user.
///
/// A minion owns the set of concurrent tasks executing its step graph. Tasks
/// are registered through [`attach`](Minion::attach); the minion guarantees
/// that each one is removed from bookkeeping exactly once whether it finishes,
/// fails, or is cancelled, and that [`join`](Minion::join) only returns once
/// no task remains in flight.
pub struct Minion {
    id: MinionId,
    campaign_id: CampaignId,
    dag_id: DagId,
    started: watch::Sender<bool>,
    attached: watch::Sender<bool>,
    latch: CountLatch,
    state: Mutex<MinionState>,
}

impl Minion {
    /// Create a minion without its maintenance routine. The routine only
    /// bounds memory; semantics are identical without it.
    pub fn new(id: MinionId, campaign_id: CampaignId, dag_id: DagId) -> Self {
        let (started, _) = watch::channel(false);
        let (attached, _) = watch::channel(false);
        Self {
            id,
            campaign_id,
            dag_id,
            started,
            attached,
            latch: CountLatch::new(),
            state: Mutex::new(MinionState {
                cancelled: false,
                completed: false,
                next_job: 0,
                step_jobs: HashMap::new(),
                completion_jobs: HashMap::new(),
                executing_steps: 0,
                hooks: Vec::new(),
            }),
        }
    }

    /// Create a minion and spawn its periodic maintenance sweep.
    pub fn spawn(
        id: MinionId,
        campaign_id: CampaignId,
        dag_id: DagId,
        config: &RuntimeConfig,
    ) -> Arc<Self> {
        let minion = Arc::new(Self::new(id, campaign_id, dag_id));
        tokio::spawn(maintenance_loop(
            Arc::downgrade(&minion),
            config.maintenance_interval(),
        ));
        minion
    }

    pub fn id(&self) -> MinionId {
        self.id
    }

    pub fn campaign_id(&self) -> &CampaignId {
        &self.campaign_id
    }

    pub fn dag_id(&self) -> &DagId {
        &self.dag_id
    }

    /// Transition from not-started to started. Idempotent.
    pub fn start(&self) {
        let transitioned = self.started.send_if_modified(|started| {
            if *started {
                false
            } else {
                *started = true;
                true
            }
        });
        if transitioned {
            debug!(minion = %self.id, "minion started");
        }
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    pub fn status(&self) -> MinionStatus {
        let state = self.state.lock().unwrap();
        if state.cancelled {
            MinionStatus::Cancelled
        } else if state.completed {
            MinionStatus::Completed
        } else if self.is_started() {
            MinionStatus::Started
        } else {
            MinionStatus::NotStarted
        }
    }

    /// Suspend until the minion has started.
    pub async fn wait_started(&self) {
        let mut rx = self.started.subscribe();
        // The sender lives in self, so the channel cannot close under us.
        let _ = rx.wait_for(|started| *started).await;
    }

    /// Register a concurrently-running unit of work under this minion.
    ///
    /// Suspends until the minion is started. If the minion is cancelled the
    /// task is aborted immediately and never registered.
    pub async fn attach(self: &Arc<Self>, task: JoinHandle<()>) {
        if self.is_cancelled() {
            task.abort();
            return;
        }
        self.wait_started().await;

        let abort = task.abort_handle();
        let job_id = {
            let mut state = self.state.lock().unwrap();
            // Re-check under the lock: cancel may have won the race.
            if state.cancelled {
                drop(state);
                task.abort();
                return;
            }
            let job_id = state.next_job;
            state.next_job += 1;
            state.executing_steps += 1;
            self.latch.increment();
            state.step_jobs.insert(job_id, abort);
            job_id
        };

        // Completion job: unwinds the bookkeeping exactly once, however the
        // step job ends.
        let minion = Arc::clone(self);
        let watcher = tokio::spawn(async move {
            if let Err(err) = task.await {
                if err.is_cancelled() {
                    debug!(minion = %minion.id, job = job_id, "step job cancelled");
                } else {
                    warn!(minion = %minion.id, job = job_id, error = %err, "step job panicked");
                }
            }
            {
                let mut state = minion.state.lock().unwrap();
                state.step_jobs.remove(&job_id);
                state.executing_steps = state.executing_steps.saturating_sub(1);
            }
            minion.latch.decrement();
        });
        self.state
            .lock()
            .unwrap()
            .completion_jobs
            .insert(job_id, watcher);

        // Unblock join() waiters gated on the first attachment.
        signal(&self.attached);
    }

    /// Cancel the minion and every task currently tracked for it. Idempotent.
    ///
    /// Force-starts the minion so nobody stays suspended waiting for a start
    /// that can no longer happen, and opens the completion latch so `join`
    /// waiters are released. Problems while individual tasks wind down are
    /// logged by their completion jobs, never propagated.
    pub fn cancel(&self) {
        let jobs = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.step_jobs.drain().collect::<Vec<_>>()
        };

        signal(&self.started);
        signal(&self.attached);
        for (job_id, handle) in jobs {
            debug!(minion = %self.id, job = job_id, "aborting step job");
            handle.abort();
        }
        self.latch.open();
        info!(minion = %self.id, campaign = %self.campaign_id, "minion cancelled");
    }

    /// Suspend until the minion has started, work has been attached (or the
    /// minion was cancelled), and no task remains in flight. On normal
    /// completion the registered hooks run, in registration order, before
    /// this returns.
    pub async fn join(&self) {
        self.wait_started().await;
        {
            let mut rx = self.attached.subscribe();
            let _ = rx.wait_for(|attached| *attached).await;
        }
        self.latch.wait().await;

        let hooks = {
            let mut state = self.state.lock().unwrap();
            if state.cancelled || state.completed {
                Vec::new()
            } else {
                state.completed = true;
                std::mem::take(&mut state.hooks)
            }
        };
        if !hooks.is_empty() {
            debug!(minion = %self.id, hooks = hooks.len(), "running completion hooks");
        }
        for hook in hooks {
            hook();
        }
    }

    /// Register a hook invoked once after the last task finishes. Callers
    /// must register before triggering the work that completes the minion;
    /// a hook registered after completion never runs.
    pub fn on_complete(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().hooks.push(Box::new(hook));
    }

    /// Number of step jobs currently tracked.
    pub fn executing_steps(&self) -> u64 {
        self.state.lock().unwrap().executing_steps
    }

    /// Bookkeeping entries currently held (step jobs + completion jobs).
    pub fn tracked_jobs(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.step_jobs.len() + state.completion_jobs.len()
    }

    fn prune_finished_jobs(&self) {
        let mut state = self.state.lock().unwrap();
        state.completion_jobs.retain(|_, handle| !handle.is_finished());
    }
}

/// Periodic sweep pruning references to tasks that already ended, to bound
/// memory under long-lived minions. Exits once the minion is dropped,
/// cancelled, or completed.
async fn maintenance_loop(minion: Weak<Minion>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(minion) = minion.upgrade() else {
            return;
        };
        {
            let state = minion.state.lock().unwrap();
            if state.cancelled || state.completed {
                return;
            }
        }
        minion.prune_finished_jobs();
        debug!(minion = %minion.id, tracked = minion.tracked_jobs(), "maintenance sweep");
    }
}

/// Latch a watch flag to true, notifying only on the transition.
fn signal(tx: &watch::Sender<bool>) {
    tx.send_if_modified(|flag| {
        if *flag {
            false
        } else {
            *flag = true;
            true
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    fn test_minion() -> Arc<Minion> {
        Arc::new(Minion::new(
            MinionId::new(),
            CampaignId::new("campaign-1"),
            DagId::new("dag-1"),
        ))
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let minion = test_minion();
        assert!(!minion.is_started());
        minion.start();
        minion.start();
        minion.start();
        assert!(minion.is_started());
        assert_eq!(minion.status(), MinionStatus::Started);
    }

    #[tokio::test]
    async fn test_concurrent_starts_transition_once() {
        let minion = test_minion();
        let starters: Vec<_> = (0..16)
            .map(|_| {
                let minion = minion.clone();
                tokio::spawn(async move { minion.start() })
            })
            .collect();
        for starter in starters {
            starter.await.unwrap();
        }
        assert!(minion.is_started());
    }

    #[tokio::test]
    async fn test_attach_suspends_until_started() {
        let minion = test_minion();
        let attacher = {
            let minion = minion.clone();
            tokio::spawn(async move {
                let task = tokio::spawn(async {});
                minion.attach(task).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!attacher.is_finished());

        minion.start();
        attacher.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_waits_for_all_attached_tasks() {
        let minion = test_minion();
        minion.start();

        let order = Arc::new(AtomicU64::new(0));
        for delay_ms in [30u64, 10, 50] {
            let order = order.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                order.fetch_add(1, Ordering::SeqCst);
            });
            minion.attach(task).await;
        }

        minion.join().await;
        assert_eq!(order.load(Ordering::SeqCst), 3);
        assert_eq!(minion.executing_steps(), 0);
        assert_eq!(minion.status(), MinionStatus::Completed);
    }

    #[tokio::test]
    async fn test_hooks_run_once_in_registration_order() {
        let minion = test_minion();
        minion.start();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            minion.on_complete(move || seen.lock().unwrap().push(i));
        }

        minion.attach(tokio::spawn(async {})).await;
        minion.join().await;
        minion.join().await; // second join must not rerun hooks
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_attach_after_cancel_aborts_task() {
        let minion = test_minion();
        minion.start();
        minion.cancel();
        minion.cancel(); // idempotent

        let ran = Arc::new(AtomicBool::new(false));
        let task = {
            let ran = ran.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                ran.store(true, Ordering::SeqCst);
            })
        };
        minion.attach(task).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(minion.executing_steps(), 0);
        assert_eq!(minion.tracked_jobs(), 0);
    }

    #[tokio::test]
    async fn test_join_returns_on_cancelled_minion() {
        let minion = test_minion();
        minion.cancel();
        // cancel force-starts and releases the latch; join must not block
        minion.join().await;
        assert_eq!(minion.status(), MinionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_tasks() {
        let minion = test_minion();
        minion.start();

        let ran = Arc::new(AtomicBool::new(false));
        let task = {
            let ran = ran.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                ran.store(true, Ordering::SeqCst);
            })
        };
        minion.attach(task).await;
        assert_eq!(minion.executing_steps(), 1);

        minion.cancel();
        minion.join().await;

        // give the completion job a moment to unwind the bookkeeping
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(minion.executing_steps(), 0);
    }

    #[tokio::test]
    async fn test_hooks_skipped_on_cancellation() {
        let minion = test_minion();
        minion.start();

        let fired = Arc::new(AtomicBool::new(false));
        {
            let fired = fired.clone();
            minion.on_complete(move || fired.store(true, Ordering::SeqCst));
        }

        minion
            .attach(tokio::spawn(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }))
            .await;
        minion.cancel();
        minion.join().await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_prunes_finished_jobs() {
        let config = RuntimeConfig {
            maintenance_interval_secs: 1,
            ..RuntimeConfig::default()
        };
        let minion = Minion::spawn(
            MinionId::new(),
            CampaignId::new("campaign-1"),
            DagId::new("dag-1"),
            &config,
        );
        minion.start();
        minion.attach(tokio::spawn(async {})).await;

        // let the step job and its completion job finish
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(minion.tracked_jobs() > 0);

        // a maintenance tick later the finished bookkeeping entry is gone
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(minion.tracked_jobs(), 0);
    }
}
