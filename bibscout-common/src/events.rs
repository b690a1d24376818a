//! Pipeline event broadcasting
//!
//! Reporting collaborators subscribe to the bus to follow a run. Emission is
//! lossy: a run never fails because nobody is listening.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted during an enrichment run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EnrichEvent {
    RunStarted {
        run_id: Uuid,
        batch_key: String,
        total: usize,
        timestamp: DateTime<Utc>,
    },
    StageStarted {
        run_id: Uuid,
        stage: String,
        pending: usize,
        timestamp: DateTime<Utc>,
    },
    StageCompleted {
        run_id: Uuid,
        stage: String,
        processed: usize,
        elapsed_ms: u64,
        timestamp: DateTime<Utc>,
    },
    /// A record moved to a new status
    RecordAdvanced {
        run_id: Uuid,
        record_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    /// A record stage operation failed after retries
    RecordFailed {
        run_id: Uuid,
        record_id: String,
        stage: String,
        error: String,
        retryable: bool,
        timestamp: DateTime<Utc>,
    },
    CooldownStarted {
        run_id: Uuid,
        processed: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: Uuid,
        state: String,
        timestamp: DateTime<Utc>,
    },
}

/// Broadcast bus for [`EnrichEvent`]
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EnrichEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<EnrichEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: EnrichEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
