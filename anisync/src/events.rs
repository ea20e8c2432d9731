use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::job::{JobId, JobKind, Priority};

/// Metadata envelope attached to every job event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            event_id: Uuid::now_v7(),
            timestamp,
        }
    }
}

/// Job lifecycle event with metadata.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    pub meta: EventMeta,
    pub payload: JobEventPayload,
}

impl JobEvent {
    pub fn new(timestamp: DateTime<Utc>, payload: JobEventPayload) -> Self {
        Self {
            meta: EventMeta::new(timestamp),
            payload,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.payload.job_id()
    }
}

/// Event payload emitted for job lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum JobEventPayload {
    Submitted {
        job_id: JobId,
        kind: JobKind,
        priority: Priority,
    },
    /// A duplicate submission was folded into an existing entry.
    Merged {
        job_id: JobId,
        kind: JobKind,
        priority: Priority,
    },
    Dispatched {
        job_id: JobId,
        kind: JobKind,
        worker_id: String,
        attempts: u32,
    },
    Succeeded {
        job_id: JobId,
        kind: JobKind,
    },
    /// Failed and will run again after backoff.
    Retrying {
        job_id: JobId,
        kind: JobKind,
        attempts: u32,
        retry_at: DateTime<Utc>,
        reason: String,
    },
    /// Could not run because of a penalty; no attempt was spent.
    Deferred {
        job_id: JobId,
        kind: JobKind,
        retry_at: DateTime<Utc>,
        reason: String,
    },
    Failed {
        job_id: JobId,
        kind: JobKind,
        attempts: u32,
        reason: String,
    },
    Cancelled {
        job_id: JobId,
        kind: JobKind,
    },
    /// A claim expired without completion and the entry was reclaimed.
    ClaimExpired {
        job_id: JobId,
        kind: JobKind,
        worker_id: Option<String>,
    },
}

impl JobEventPayload {
    pub fn job_id(&self) -> JobId {
        match self {
            JobEventPayload::Submitted { job_id, .. }
            | JobEventPayload::Merged { job_id, .. }
            | JobEventPayload::Dispatched { job_id, .. }
            | JobEventPayload::Succeeded { job_id, .. }
            | JobEventPayload::Retrying { job_id, .. }
            | JobEventPayload::Deferred { job_id, .. }
            | JobEventPayload::Failed { job_id, .. }
            | JobEventPayload::Cancelled { job_id, .. }
            | JobEventPayload::ClaimExpired { job_id, .. } => *job_id,
        }
    }
}

/// In-process event bus using a tokio broadcast channel.
///
/// Publishing never blocks. Subscribers that fall behind receive
/// `RecvError::Lagged` and miss the overwritten events.
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Publish an event. Dropped silently when nobody listens.
    pub fn publish(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_fan_out_to_all_subscribers() {
        let bus = InProcEventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        let job_id = JobId::new();
        bus.publish(JobEvent::new(
            Utc::now(),
            JobEventPayload::Succeeded {
                job_id,
                kind: JobKind::new("t"),
            },
        ));

        assert_eq!(rx1.recv().await.unwrap().job_id(), job_id);
        assert_eq!(rx2.recv().await.unwrap().job_id(), job_id);
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = InProcEventBus::new(1);
        bus.publish(JobEvent::new(
            Utc::now(),
            JobEventPayload::Cancelled {
                job_id: JobId::new(),
                kind: JobKind::new("t"),
            },
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_lags() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(JobEvent::new(
                Utc::now(),
                JobEventPayload::Cancelled {
                    job_id: JobId::new(),
                    kind: JobKind::new("t"),
                },
            ));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }
}
