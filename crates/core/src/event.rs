//! Domain event system — decoupled communication between bounded contexts.
//!
//! Events are published when something interesting happens in the
//! compaction engine. A terminal UI, a log sink or a test can subscribe
//! without the pipeline knowing who listens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use crate::progress::{CycleKind, ProgressEvent};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A compaction cycle changed state
    CompactionProgress(ProgressEvent),

    /// The harness configuration mirrored into the state bridge changed
    HarnessReconfigured {
        generation: u64,
        observer_model: String,
        reflector_model: String,
        timestamp: DateTime<Utc>,
    },

    /// A counter removal was clamped at zero
    CounterClamped {
        kind: CycleKind,
        requested: u64,
        available: u64,
        timestamp: DateTime<Utc>,
    },

    /// A completion arrived for a cycle that is no longer active
    StaleCompletionDropped {
        kind: CycleKind,
        cycle_id: u64,
        active_cycle_id: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// The single-slot instance cache replaced its entry
    InstanceEvicted {
        scope: String,
        timestamp: DateTime<Utc>,
    },

    /// An error occurred
    ErrorOccurred {
        context: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
/// Components can subscribe to receive all events and filter for what they care about.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // Ignore send errors (no subscribers = that's fine)
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
