//! Typed lifecycle events for UI and telemetry collaborators.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::entities::EntityType;
use crate::sync::{ConflictPolicy, PendingMutation, SyncTrigger};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    SyncStarted {
        trigger: SyncTrigger,
    },
    SyncProgress {
        processed: usize,
        total: usize,
    },
    SyncCompleted,
    SyncAborted,
    SyncFailed {
        message: String,
    },
    MutationDeadLettered {
        mutation: PendingMutation,
        error: String,
    },
    PendingCountChanged {
        count: usize,
    },
    ConflictDetected {
        entity_type: EntityType,
        entity_id: String,
    },
    ConflictResolved {
        entity_type: EntityType,
        entity_id: String,
        policy: ConflictPolicy,
    },
}

/// Fan-out channel for [`SyncEvent`]s.
///
/// Emitting never blocks and never fails; events sent while nobody listens are dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}
