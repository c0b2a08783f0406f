//! Connection state reported by the sync engine.

use serde::Serialize;

/// Sync state published on [`crate::events::Event::SyncStatus`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    /// No remote reachable; writes queue locally
    Offline,
    /// A drain or pull is in flight
    Syncing,
    /// Last cycle finished with nothing pending
    Synced,
    /// Last cycle left work behind (transient failures or fatal rejections)
    Error,
}
