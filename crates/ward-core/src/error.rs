//! Error types for ward-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using ward-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ward-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record or queue entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote RPC failure
    #[error(transparent)]
    Remote(#[from] RemoteError),

    /// The operation needs the remote and none is reachable
    #[error("Offline: {0}")]
    Offline(String),

    /// The durable queue could not persist a mutation
    #[error("Storage error: {0}")]
    Storage(String),
}
