//! Services shared by the coordinator, the sync engine and the binaries.

mod local_store;

pub use local_store::LocalStore;
