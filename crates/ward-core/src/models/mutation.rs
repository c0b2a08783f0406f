//! Outbox mutation model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::record::{Record, RecordId, RecordKind};
use crate::error::Error;

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Write operation carried by a mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Add,
    Update,
    Delete,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidInput(format!("unknown operation: {other}"))),
        }
    }
}

/// A write intent with its payload
///
/// `Add` and `Update` carry the full record (whole-document replace);
/// `Delete` needs only the target id held by the mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "lowercase")]
pub enum Change {
    Add(Record),
    Update(Record),
    Delete,
}

impl Change {
    pub const fn operation(&self) -> Operation {
        match self {
            Self::Add(_) => Operation::Add,
            Self::Update(_) => Operation::Update,
            Self::Delete => Operation::Delete,
        }
    }

    pub const fn payload(&self) -> Option<&Record> {
        match self {
            Self::Add(record) | Self::Update(record) => Some(record),
            Self::Delete => None,
        }
    }

    /// Rebuild a change from its stored operation and payload columns
    pub fn from_parts(operation: Operation, payload: Option<Record>) -> crate::Result<Self> {
        match (operation, payload) {
            (Operation::Add, Some(record)) => Ok(Self::Add(record)),
            (Operation::Update, Some(record)) => Ok(Self::Update(record)),
            (Operation::Delete, _) => Ok(Self::Delete),
            (operation, None) => Err(Error::InvalidInput(format!(
                "{operation} mutation is missing its payload"
            ))),
        }
    }
}

/// Lifecycle of a queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    /// Not yet confirmed by the remote
    Pending,
    /// Confirmed by the remote; eligible for retention cleanup
    Synced,
    /// Rejected or retried out; needs a manual retry of the original action
    FailedFatal,
}

impl MutationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::FailedFatal => "failed_fatal",
        }
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "synced" => Ok(Self::Synced),
            "failed_fatal" => Ok(Self::FailedFatal),
            other => Err(Error::InvalidInput(format!("unknown mutation status: {other}"))),
        }
    }
}

/// A durable outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: MutationId,
    pub collection: RecordKind,
    pub doc_id: RecordId,
    pub change: Change,
    /// Store value before the optimistic apply; `None` when the record did not exist
    pub previous: Option<Record>,
    /// Creation timestamp (Unix ms)
    pub timestamp: i64,
    /// Local insertion order, assigned by the queue on append
    pub seq: i64,
    pub status: MutationStatus,
    pub retry_count: u32,
    pub idempotency_key: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Mutation {
    /// Create a pending mutation stamped with the current time
    pub fn new(
        collection: RecordKind,
        doc_id: RecordId,
        change: Change,
        previous: Option<Record>,
    ) -> Self {
        Self::at(
            collection,
            doc_id,
            change,
            previous,
            chrono::Utc::now().timestamp_millis(),
        )
    }

    /// Create a pending mutation with an explicit timestamp
    pub fn at(
        collection: RecordKind,
        doc_id: RecordId,
        change: Change,
        previous: Option<Record>,
        timestamp: i64,
    ) -> Self {
        let idempotency_key =
            idempotency_key(collection, &doc_id, change.operation(), timestamp);
        Self {
            id: MutationId::new(),
            collection,
            doc_id,
            change,
            previous,
            timestamp,
            seq: 0,
            status: MutationStatus::Pending,
            retry_count: 0,
            idempotency_key,
            last_error: None,
        }
    }

    pub const fn operation(&self) -> Operation {
        self.change.operation()
    }

    pub const fn payload(&self) -> Option<&Record> {
        self.change.payload()
    }

    pub fn is_pending(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

/// Key under which the remote de-duplicates a pushed mutation
pub fn idempotency_key(
    collection: RecordKind,
    doc_id: &RecordId,
    operation: Operation,
    timestamp: i64,
) -> String {
    format!("{}:{doc_id}:{operation}:{timestamp}", collection.collection())
}
