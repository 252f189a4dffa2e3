//! Concurrency-control utilities shared by the minion and the decorators.
//!
//! Both types follow the same discipline: state under a plain mutex, waiters
//! parked on a [`Notify`], and the lock never held across a suspension point.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::types::MinionId;

/// A counting latch: `wait()` suspends until the count reaches zero.
///
/// Unlike a semaphore this counts *up* on attach and *down* on completion,
/// and can be forced open when the owner is cancelled.
#[derive(Debug, Default)]
pub struct CountLatch {
    count: Mutex<u64>,
    zero: Notify,
}

impl CountLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        *self.count.lock().unwrap() += 1;
    }

    /// Decrement the count, waking waiters if it reaches zero.
    /// Returns the count after the decrement.
    pub fn decrement(&self) -> u64 {
        let remaining = {
            let mut count = self.count.lock().unwrap();
            *count = count.saturating_sub(1);
            *count
        };
        if remaining == 0 {
            self.zero.notify_waiters();
        }
        remaining
    }

    pub fn count(&self) -> u64 {
        *self.count.lock().unwrap()
    }

    /// Force the latch open regardless of the current count, waking all waiters.
    pub fn open(&self) {
        *self.count.lock().unwrap() = 0;
        self.zero.notify_waiters();
    }

    /// Suspend until the count is zero. Returns immediately if it already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *self.count.lock().unwrap() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Per-minion in-flight execution counts for a single step.
///
/// `enter` hands back an RAII guard so the count is released even when the
/// executing task is cancelled mid-flight.
#[derive(Debug, Default)]
pub struct InFlightGauge {
    counts: Mutex<HashMap<MinionId, u64>>,
    idle: Notify,
}

impl InFlightGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self, minion: MinionId) -> InFlightGuard<'_> {
        *self.counts.lock().unwrap().entry(minion).or_insert(0) += 1;
        InFlightGuard {
            gauge: self,
            minion,
        }
    }

    pub fn in_flight(&self, minion: &MinionId) -> u64 {
        self.counts.lock().unwrap().get(minion).copied().unwrap_or(0)
    }

    /// Suspend until the given minion has no executions in flight.
    pub async fn wait_idle(&self, minion: &MinionId) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight(minion) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn exit(&self, minion: &MinionId) {
        let empty = {
            let mut counts = self.counts.lock().unwrap();
            match counts.get_mut(minion) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        counts.remove(minion);
                        true
                    } else {
                        false
                    }
                }
                None => false,
            }
        };
        if empty {
            self.idle.notify_waiters();
        }
    }
}

/// Releases one in-flight slot on drop.
pub struct InFlightGuard<'a> {
    gauge: &'a InFlightGauge,
    minion: MinionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.gauge.exit(&self.minion);
    }
}
