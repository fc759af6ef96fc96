//! Orchestration event bus.
//!
//! Single writer per emitter, many subscribers, non-blocking publish. The
//! bus is lossy by design: a subscriber that cannot keep up misses the
//! events that fell out of the channel backlog, and sees a lag notice
//! instead. Subscribers that must not miss anything should drain promptly
//! or batch on their own side.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::{JobId, PoolId, WorkerId};

/// Backlog per subscriber before events are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// A timestamped orchestration event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: OrchestrationEventKind,
}

/// Everything the orchestration plane announces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationEventKind {
    SystemStarted,
    SystemStopped,
    JobQueued {
        job_id: JobId,
    },
    JobAssigned {
        job_id: JobId,
        worker_id: WorkerId,
    },
    JobStarted {
        job_id: JobId,
        worker_id: WorkerId,
    },
    JobCompleted {
        job_id: JobId,
        success: bool,
    },
    JobRetried {
        job_id: JobId,
        retry_count: u32,
    },
    PoolCreated {
        pool_id: PoolId,
    },
    AutoScalingTriggered {
        pool_id: PoolId,
        from: u32,
        to: u32,
    },
    MetricsCollected,
}

/// Multi-producer, multi-subscriber event bus.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OrchestrationEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates an event bus with the default backlog.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Publishes an event stamped with the current time. Never blocks.
    pub fn publish(&self, kind: OrchestrationEventKind) {
        // No subscribers is a normal state, not an error.
        let _ = self.sender.send(OrchestrationEvent {
            timestamp: Utc::now(),
            kind,
        });
    }

    /// Subscribes to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestrationEvent> {
        self.sender.subscribe()
    }
}
