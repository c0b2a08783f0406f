//! Patient handover inbox model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::record::{Patient, RecordId};
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InboxStatus {
    #[default]
    Pending,
    Accepted,
    Declined,
}

impl InboxStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboxStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "declined" => Ok(Self::Declined),
            other => Err(Error::InvalidInput(format!("unknown inbox status: {other}"))),
        }
    }
}

/// A patient handed over from another clinician's account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub id: RecordId,
    pub from_user: String,
    pub to_user: String,
    pub patient: Patient,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub status: InboxStatus,
    /// Unix ms
    pub sent_at: i64,
}
