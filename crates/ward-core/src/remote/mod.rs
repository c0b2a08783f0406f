//! Remote RPC surface consumed by the sync engine.
//!
//! The remote store is an external collaborator: this module defines the
//! request/response contract, the failure taxonomy used to decide between
//! retry and rollback, and two transports. [`HttpRemote`] talks JSON over
//! HTTP to `ward-api`; [`MemoryRemote`] is an in-process backend with the same
//! write rules, used by tests and by the API server itself.

mod http;
mod memory;
mod protocol;

use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::{Record, RecordKind};

pub use http::{HttpRemote, USER_HEADER};
pub use memory::{HeldPush, MemoryBackend, MemoryRemote, FORCE_FULL_SYNC_REV_GAP};
pub use protocol::{
    AcceptInboxResponse, CheckInboxResponse, DeclineInboxResponse, EmptyTrashRequest,
    EmptyTrashResponse, HeartbeatRequest, HeartbeatResponse, InboxActionRequest, LoadRequest,
    LoadResponse, MoveToTrashRequest, MoveToTrashResponse, PushAck, PushRequest,
    RestoreFromTrashRequest, RestoreFromTrashResponse, SaveOutcome, SaveRequest, SaveResponse,
    SendPatientRequest, SendPatientResponse,
};

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Reason code attached to a write the remote refused outright
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectCode {
    PermissionDenied,
    InvalidArgument,
    FailedPrecondition,
    NotFound,
}

impl RejectCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission-denied",
            Self::InvalidArgument => "invalid-argument",
            Self::FailedPrecondition => "failed-precondition",
            Self::NotFound => "not-found",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "permission-denied" => Some(Self::PermissionDenied),
            "invalid-argument" => Some(Self::InvalidArgument),
            "failed-precondition" => Some(Self::FailedPrecondition),
            "not-found" => Some(Self::NotFound),
            _ => None,
        }
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a remote RPC
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Remote request timed out")]
    Timeout,
    #[error("Remote unavailable (HTTP {status})")]
    Unavailable { status: u16 },
    #[error("Remote rejected the write ({code}): {message}")]
    Rejected { code: RejectCode, message: String },
    #[error("Invalid remote response: {0}")]
    Protocol(String),
}

/// Outcome class of a failed push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The source of truth refused the write: roll back
    Fatal,
    /// Delivery failed: keep the entry pending and retry
    Transient,
}

impl RemoteError {
    pub fn rejected(code: RejectCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Classify this error for the outbox
    ///
    /// Only an explicit rejection is fatal. Timeouts, transport failures,
    /// server-side unavailability and undecodable responses are retried.
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Rejected { .. } => FailureClass::Fatal,
            Self::Network(_) | Self::Timeout | Self::Unavailable { .. } | Self::Protocol(_) => {
                FailureClass::Transient
            }
        }
    }

    pub const fn is_fatal(&self) -> bool {
        matches!(self.class(), FailureClass::Fatal)
    }
}

/// Change notification delivered by a live subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    /// Full authoritative contents of one collection at `rev`
    Snapshot {
        kind: RecordKind,
        records: Vec<Record>,
        rev: u64,
    },
    Error(RemoteError),
}

/// Cancellable stream of remote changes for one collection
pub struct Subscription {
    kind: RecordKind,
    receiver: mpsc::Receiver<RemoteChange>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Wrap a receiver fed by `task`; cancelling aborts the task
    pub const fn new(
        kind: RecordKind,
        receiver: mpsc::Receiver<RemoteChange>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            kind,
            receiver,
            task: Some(task),
        }
    }

    pub const fn kind(&self) -> RecordKind {
        self.kind
    }

    /// Next change; `None` once the subscription is cancelled or the source ends
    pub async fn next(&mut self) -> Option<RemoteChange> {
        self.receiver.recv().await
    }

    /// Stop the feed. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("kind", &self.kind)
            .field("active", &self.task.is_some())
            .finish()
    }
}

/// Request/response contract of the remote store
pub trait RemoteApi: Send + Sync + 'static {
    /// Revision-gated fetch of the whole aggregate
    fn load_data(
        &self,
        request: LoadRequest,
    ) -> impl Future<Output = RemoteResult<LoadResponse>> + Send;

    /// Whole-aggregate replace guarded by revision and wipe checks
    fn save_data(
        &self,
        request: SaveRequest,
    ) -> impl Future<Output = RemoteResult<SaveOutcome>> + Send;

    /// Apply one outbox entry; duplicates by idempotency key are no-ops
    fn push_mutation(
        &self,
        request: PushRequest,
    ) -> impl Future<Output = RemoteResult<PushAck>> + Send;

    fn move_to_trash(
        &self,
        request: MoveToTrashRequest,
    ) -> impl Future<Output = RemoteResult<MoveToTrashResponse>> + Send;

    fn restore_from_trash(
        &self,
        request: RestoreFromTrashRequest,
    ) -> impl Future<Output = RemoteResult<RestoreFromTrashResponse>> + Send;

    fn empty_trash(
        &self,
        request: EmptyTrashRequest,
    ) -> impl Future<Output = RemoteResult<EmptyTrashResponse>> + Send;

    fn send_patient(
        &self,
        request: SendPatientRequest,
    ) -> impl Future<Output = RemoteResult<SendPatientResponse>> + Send;

    fn check_inbox(&self) -> impl Future<Output = RemoteResult<CheckInboxResponse>> + Send;

    fn accept_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> impl Future<Output = RemoteResult<AcceptInboxResponse>> + Send;

    fn decline_inbox_patient(
        &self,
        request: InboxActionRequest,
    ) -> impl Future<Output = RemoteResult<DeclineInboxResponse>> + Send;

    fn heartbeat(
        &self,
        request: HeartbeatRequest,
    ) -> impl Future<Output = RemoteResult<HeartbeatResponse>> + Send;

    /// Open a live feed of snapshots for one collection
    ///
    /// Must be called from within a tokio runtime.
    fn subscribe(&self, kind: RecordKind, client_rev: u64) -> RemoteResult<Subscription>;
}
