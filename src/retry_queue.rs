// =============================================================================
// retry_queue.rs - THE WAITING ROOM
// =============================================================================
//
// When a fallback strategy says "queue it for later", the request lands here.
// The engine never replays anything itself. It hands the request to a bounded
// crossbeam channel and walks away; a drain task (see publisher.rs) moves it
// into Redis where an external replayer picks it up once the dependency is
// healthy again.
//
// The channel is bounded on purpose: a dead dependency plus unbounded
// deferral is just a slower way to run out of memory.
// =============================================================================

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A call the caller agreed to have replayed later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeferredRequest {
    pub id: Uuid,
    pub dependency_key: String,
    pub operation: String,
    pub payload: Option<serde_json::Value>,
    /// Why the live call did not happen (`circuit_open`, `timeout`, ...).
    pub reason: String,
    pub enqueued_at: DateTime<Utc>,
}

impl DeferredRequest {
    pub fn new(
        dependency_key: impl Into<String>,
        operation: impl Into<String>,
        payload: Option<serde_json::Value>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dependency_key: dependency_key.into(),
            operation: operation.into(),
            payload,
            reason: reason.into(),
            enqueued_at: Utc::now(),
        }
    }

    pub fn ticket(&self) -> DeferredTicket {
        DeferredTicket {
            id: self.id,
            enqueued_at: self.enqueued_at,
        }
    }
}

/// Receipt handed back to the caller: "accepted, pending".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeferredTicket {
    pub id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("retry queue is full ({capacity} pending)")]
    Full { capacity: usize },

    #[error("retry queue consumer has gone away")]
    Disconnected,
}

/// Somewhere deferred requests can be parked.
pub trait RetryQueue: Send + Sync {
    fn enqueue(&self, request: DeferredRequest) -> Result<DeferredTicket, QueueError>;

    /// Requests waiting to be drained, if the queue can tell.
    fn depth(&self) -> usize {
        0
    }
}

/// In-process queue backed by a bounded crossbeam channel.
pub struct ChannelRetryQueue {
    sender: Sender<DeferredRequest>,
    capacity: usize,
}

impl ChannelRetryQueue {
    /// Create the queue and the receiving end for whoever drains it.
    pub fn bounded(capacity: usize) -> (Self, Receiver<DeferredRequest>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender, capacity }, receiver)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl RetryQueue for ChannelRetryQueue {
    fn enqueue(&self, request: DeferredRequest) -> Result<DeferredTicket, QueueError> {
        let ticket = request.ticket();
        match self.sender.try_send(request) {
            Ok(()) => Ok(ticket),
            Err(TrySendError::Full(_)) => Err(QueueError::Full {
                capacity: self.capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(QueueError::Disconnected),
        }
    }

    fn depth(&self) -> usize {
        self.sender.len()
    }
}
