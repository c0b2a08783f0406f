//! Device session (heartbeat) model

use serde::{Deserialize, Serialize};

/// Inactivity after which a device leaves the active set (5 minutes, in ms)
pub const SESSION_TTL_MS: i64 = 5 * 60 * 1000;

/// Ephemeral per-device presence used to detect revision drift
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSession {
    pub device_id: String,
    #[serde(default)]
    pub device_info: Option<String>,
    /// Unix ms
    pub last_seen: i64,
    pub client_rev: u64,
}

impl DeviceSession {
    pub const fn is_active(&self, now: i64) -> bool {
        now.saturating_sub(self.last_seen) < SESSION_TTL_MS
    }
}
