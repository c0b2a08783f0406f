pub mod common;
pub mod inbox;
pub mod patient;
pub mod queue;
pub mod sync;
pub mod task;
pub mod trash;
pub mod unit;
