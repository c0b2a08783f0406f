//! Wire shapes of the remote RPC surface (camelCase JSON)

use serde::{Deserialize, Serialize};

use super::RemoteError;
use crate::models::{Aggregate, InboxItem, Operation, Patient, Record, RecordId, RecordKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadRequest {
    pub client_rev: u64,
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadResponse {
    /// Omitted when the client is already up to date
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Aggregate>,
    pub rev: u64,
    #[serde(default)]
    pub up_to_date: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    pub payload: Aggregate,
    pub base_rev: u64,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub confirm_wipe: bool,
    pub device_id: String,
}

/// Result of a whole-aggregate save
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved {
        rev: u64,
    },
    /// `base_rev` was stale and `force` was not set; nothing was written
    Conflict {
        server_rev: u64,
        server_data: Aggregate,
    },
    /// The save would have wiped a non-empty patient list; nothing was written
    Safeguard {
        server_patient_count: usize,
    },
}

/// Flat wire form: `{rev}` | `{conflict, serverRev, serverData}` | `{safeguard, serverPatientCount}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub conflict: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_rev: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Aggregate>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub safeguard: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_patient_count: Option<usize>,
}

impl From<SaveOutcome> for SaveResponse {
    fn from(value: SaveOutcome) -> Self {
        match value {
            SaveOutcome::Saved { rev } => Self {
                rev: Some(rev),
                ..Self::default()
            },
            SaveOutcome::Conflict {
                server_rev,
                server_data,
            } => Self {
                conflict: true,
                server_rev: Some(server_rev),
                server_data: Some(server_data),
                ..Self::default()
            },
            SaveOutcome::Safeguard {
                server_patient_count,
            } => Self {
                safeguard: true,
                server_patient_count: Some(server_patient_count),
                ..Self::default()
            },
        }
    }
}

impl TryFrom<SaveResponse> for SaveOutcome {
    type Error = RemoteError;

    fn try_from(value: SaveResponse) -> Result<Self, Self::Error> {
        if value.conflict {
            let server_rev = value.server_rev.ok_or_else(|| {
                RemoteError::Protocol("conflict response without serverRev".to_string())
            })?;
            return Ok(Self::Conflict {
                server_rev,
                server_data: value.server_data.unwrap_or_default(),
            });
        }
        if value.safeguard {
            return Ok(Self::Safeguard {
                server_patient_count: value.server_patient_count.unwrap_or_default(),
            });
        }
        value
            .rev
            .map(|rev| Self::Saved { rev })
            .ok_or_else(|| RemoteError::Protocol("save response without rev".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub idempotency_key: String,
    pub collection: RecordKind,
    pub operation: Operation,
    pub doc_id: RecordId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Record>,
    pub device_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushAck {
    /// Server revision after the write (or the current one for a duplicate)
    pub rev: u64,
    /// The idempotency key had already been applied
    #[serde(default)]
    pub duplicate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToTrashRequest {
    pub item_ids: Vec<RecordId>,
    pub item_type: RecordKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveToTrashResponse {
    pub trashed_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFromTrashRequest {
    pub item_ids: Vec<RecordId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreFromTrashResponse {
    pub restored_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyTrashRequest {
    /// Empties the whole trash when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_ids: Option<Vec<RecordId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmptyTrashResponse {
    pub deleted_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPatientRequest {
    pub to_user: String,
    pub patient: Patient,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendPatientResponse {
    pub inbox_id: RecordId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInboxResponse {
    pub items: Vec<InboxItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxActionRequest {
    pub inbox_id: RecordId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInboxResponse {
    pub patient: Patient,
    pub rev: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclineInboxResponse {
    pub declined: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<String>,
    pub client_rev: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub rev: u64,
    #[serde(default)]
    pub force_full_sync: bool,
    #[serde(default)]
    pub rev_gap: u64,
    #[serde(default)]
    pub active_devices: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_response_conflict_shape() {
        let response = SaveResponse::from(SaveOutcome::Conflict {
            server_rev: 6,
            server_data: Aggregate::default(),
        });
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["conflict"], json!(true));
        assert_eq!(value["serverRev"], json!(6));
        assert!(value.get("rev").is_none());
        assert!(value.get("safeguard").is_none());
    }

    #[test]
    fn save_response_parses_plain_rev() {
        let response: SaveResponse = serde_json::from_value(json!({ "rev": 12 })).unwrap();
        assert_eq!(
            SaveOutcome::try_from(response).unwrap(),
            SaveOutcome::Saved { rev: 12 }
        );
    }

    #[test]
    fn save_response_parses_safeguard() {
        let response: SaveResponse =
            serde_json::from_value(json!({ "safeguard": true, "serverPatientCount": 4 })).unwrap();
        assert_eq!(
            SaveOutcome::try_from(response).unwrap(),
            SaveOutcome::Safeguard {
                server_patient_count: 4
            }
        );
    }

    #[test]
    fn save_response_without_rev_is_protocol_error() {
        let error = SaveOutcome::try_from(SaveResponse::default()).unwrap_err();
        assert!(matches!(error, RemoteError::Protocol(_)));
    }

    #[test]
    fn load_response_omits_data_when_up_to_date() {
        let response = LoadResponse {
            data: None,
            rev: 5,
            up_to_date: true,
        };
        let value = serde_json::to_value(response).unwrap();
        assert_eq!(value, json!({ "rev": 5, "upToDate": true }));
    }
}
