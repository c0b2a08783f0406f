//! Typed notifications from the store, coordinator and sync engine.

use tokio::sync::broadcast;

use crate::models::{Aggregate, MutationId, RecordId, RecordKind};
use crate::state::SyncState;

const DEFAULT_CAPACITY: usize = 256;

/// How a store collection changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Added,
    Updated,
    Removed,
    /// A rollback put back the pre-mutation value (or dropped an added record)
    RolledBack,
    /// The whole collection was replaced by a remote snapshot
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    StoreChanged {
        kind: RecordKind,
        /// `None` for collection-wide replaces
        doc_id: Option<RecordId>,
        change: StoreChange,
    },
    SyncStatus(SyncState),
    MutationSynced {
        mutation_id: MutationId,
        collection: RecordKind,
        doc_id: RecordId,
        rev: u64,
    },
    /// The remote rejected a write (or it ran out of retries) and it was rolled back
    MutationFailed {
        mutation_id: MutationId,
        collection: RecordKind,
        doc_id: RecordId,
        message: String,
    },
    MutationRetrying {
        mutation_id: MutationId,
        retry_count: u32,
        error: String,
    },
    /// A whole-aggregate save hit a stale base revision
    Conflict {
        server_rev: u64,
        server_data: Aggregate,
    },
    /// A whole-aggregate save would have wiped the server's patients
    Safeguard { server_patient_count: usize },
    TrashUpdated { count: usize },
    InboxUpdated { pending: usize },
    /// Other devices on the account are ahead of this one
    RevisionDrift { rev_gap: u64, active_devices: usize },
}

/// Broadcast fan-out of [`Event`]s; cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; returns how many received it.
    pub fn publish(&self, event: Event) -> usize {
        // No receivers is fine: nobody is listening yet
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
