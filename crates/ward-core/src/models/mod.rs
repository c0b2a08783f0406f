//! Data models for Ward

mod inbox;
mod mutation;
mod record;
mod session;
mod trash;

pub use inbox::{InboxItem, InboxStatus};
pub use mutation::{idempotency_key, Change, Mutation, MutationId, MutationStatus, Operation};
pub use record::{
    Aggregate, Patient, PatientStatus, Record, RecordId, RecordKind, Task, TaskPriority, Ward,
};
pub use session::{DeviceSession, SESSION_TTL_MS};
pub use trash::{TrashItem, TRASH_RETENTION_MS};
