//! Outbox drain, snapshot pull and live subscriptions.

mod engine;

pub use engine::{FlushReport, PullOutcome, SyncEngine};
