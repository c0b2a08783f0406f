//! Local durable storage: outbox queue and mirror tables

mod connection;
mod migrations;
mod mirror;
mod wal;

pub use connection::Database;
pub use mirror::{
    meta_collection_rev, LibSqlMirrorRepository, MirrorRepository, META_CLIENT_REV,
    META_DEVICE_ID, META_LAST_PULL_AT,
};
pub use wal::{LibSqlWalRepository, QueueCounts, WalRepository};
