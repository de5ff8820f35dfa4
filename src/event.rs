//! Structured events emitted by the scheduler.
//!
//! Consumers subscribe to the event stream for alerting, dashboards or
//! audit logs. An event is only published after the store write it
//! describes has landed, so subscribers never see an outcome that a restart
//! could take back.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{ErrorClass, Finding, ItemId, Status};

/// Buffered events per subscriber before it starts lagging.
const EVENT_BUFFER: usize = 1024;

/// A structured event emitted by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number. Consumers can detect gaps.
    pub seq: u64,
    /// When this event occurred.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    ItemDispatched {
        id: ItemId,
        slot: usize,
        dispatch_id: Uuid,
    },
    /// The outcome record for `id` is durable.
    ItemCompleted {
        id: ItemId,
        status: Status,
        retryable: bool,
        findings: Vec<Finding>,
        error_class: Option<ErrorClass>,
    },
    /// A dispatch finished but a terminal record was already there.
    RecordRejected {
        id: ItemId,
        existing: Status,
    },
}

/// Fan-out of scheduler events.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    seq: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, kind: EventKind) -> Event {
        let event = Event {
            seq: self.seq.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp: Utc::now(),
            kind,
        };
        let _ = self.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
