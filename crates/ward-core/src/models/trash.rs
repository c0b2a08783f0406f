//! Trash model

use serde::{Deserialize, Serialize};

use super::record::{Record, RecordId, RecordKind};

/// How long a trashed record stays restorable (30 days, in ms)
pub const TRASH_RETENTION_MS: i64 = 30 * 24 * 60 * 60 * 1000;

/// A record moved out of its active collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrashItem {
    pub id: RecordId,
    pub item_type: RecordKind,
    pub record: Record,
    pub deleted_by: String,
    /// Unix ms
    pub deleted_at: i64,
    /// After this instant the remote sweep removes the item permanently
    pub expires_at: i64,
}

impl TrashItem {
    pub fn new(record: Record, deleted_by: impl Into<String>, deleted_at: i64) -> Self {
        Self {
            id: record.id().clone(),
            item_type: record.kind(),
            record,
            deleted_by: deleted_by.into(),
            deleted_at,
            expires_at: deleted_at.saturating_add(TRASH_RETENTION_MS),
        }
    }

    pub const fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }
}
