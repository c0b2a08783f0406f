//! ward-core - Core library for Ward
//!
//! This crate contains the record models, local durable storage (outbox and
//! mirror), the in-memory store, the mutation coordinator and the sync
//! engine shared by the Ward CLI and API server.

pub mod config;
pub mod data;
pub mod db;
pub mod error;
pub mod events;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod store;
pub mod sync;
pub mod util;

pub use config::{ConfigError, EngineConfig};
pub use data::{Data, SaveOptions};
pub use error::{Error, Result};
pub use events::{Event, EventBus, StoreChange};
pub use models::{
    Aggregate, Change, Mutation, MutationId, MutationStatus, Patient, Record, RecordId,
    RecordKind, Task, Ward,
};
pub use remote::{HttpRemote, MemoryBackend, MemoryRemote, RemoteApi, RemoteError};
pub use services::LocalStore;
pub use state::SyncState;
pub use store::Store;
pub use sync::{FlushReport, PullOutcome, SyncEngine};
