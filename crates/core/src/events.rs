use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::context::StepContext;
use crate::types::{CampaignId, DagId, MinionId};

/// A lifecycle event published by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub campaign_id: CampaignId,
    pub timestamp: DateTime<Utc>,
    /// Flat identification tags (campaign/scenario/dag/step/minion) where a
    /// context was involved; empty for campaign-scope events.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub kind: EventKind,
}

impl Event {
    pub fn new(campaign_id: CampaignId, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            campaign_id,
            timestamp: Utc::now(),
            tags: HashMap::new(),
            kind,
        }
    }

    fn for_context(ctx: &StepContext, kind: EventKind) -> Self {
        let mut event = Self::new(ctx.campaign_id().clone(), kind);
        event.tags = ctx.tags();
        event
    }

    pub fn step_started(ctx: &StepContext) -> Self {
        Self::for_context(
            ctx,
            EventKind::StepStarted {
                step: ctx.step().to_string(),
                minion: ctx.minion_id(),
                iteration: ctx.iteration(),
            },
        )
    }

    pub fn step_completed(ctx: &StepContext, duration_ms: u64) -> Self {
        Self::for_context(
            ctx,
            EventKind::StepCompleted {
                step: ctx.step().to_string(),
                minion: ctx.minion_id(),
                duration_ms,
            },
        )
    }

    pub fn step_failed(ctx: &StepContext, error: impl Into<String>) -> Self {
        Self::for_context(
            ctx,
            EventKind::StepFailed {
                step: ctx.step().to_string(),
                minion: ctx.minion_id(),
                error: error.into(),
            },
        )
    }

    pub fn step_timed_out(ctx: &StepContext, after_ms: u64) -> Self {
        Self::for_context(
            ctx,
            EventKind::StepTimedOut {
                step: ctx.step().to_string(),
                minion: ctx.minion_id(),
                after_ms,
            },
        )
    }

    pub fn step_start_failed(
        campaign_id: CampaignId,
        step: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self::new(
            campaign_id,
            EventKind::StepStartFailed {
                step: step.into(),
                error: error.into(),
            },
        )
    }

    pub fn step_summary(
        campaign_id: CampaignId,
        step: impl Into<String>,
        successes: u64,
        failures: u64,
    ) -> Self {
        Self::new(
            campaign_id,
            EventKind::StepSummary {
                step: step.into(),
                successes,
                failures,
            },
        )
    }

    pub fn minion_completed(campaign_id: CampaignId, minion: MinionId, dag: DagId) -> Self {
        Self::new(campaign_id, EventKind::MinionCompleted { minion, dag })
    }

    pub fn dead_end_reached(
        campaign_id: CampaignId,
        minion: MinionId,
        step: impl Into<String>,
    ) -> Self {
        Self::new(
            campaign_id,
            EventKind::DeadEndReached {
                minion,
                step: step.into(),
            },
        )
    }
}

/// What happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    StepStarted {
        step: String,
        minion: MinionId,
        iteration: u64,
    },
    StepCompleted {
        step: String,
        minion: MinionId,
        duration_ms: u64,
    },
    StepFailed {
        step: String,
        minion: MinionId,
        error: String,
    },
    StepTimedOut {
        step: String,
        minion: MinionId,
        after_ms: u64,
    },
    StepStartFailed {
        step: String,
        error: String,
    },
    StepSummary {
        step: String,
        successes: u64,
        failures: u64,
    },
    MinionCompleted {
        minion: MinionId,
        dag: DagId,
    },
    DeadEndReached {
        minion: MinionId,
        step: String,
    },
}

/// Destination for runtime events. Backends live outside this crate;
/// publication failures are logged by callers, never propagated into
/// execution.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event) -> anyhow::Result<()>;
}

/// Sink that drops every event.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn publish(&self, _event: Event) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory sink, for tests and local inspection.
#[derive(Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<Event>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for MemoryEventSink {
    async fn publish(&self, event: Event) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
