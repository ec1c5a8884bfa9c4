//! SQLite persistence for the outbox queue.

mod model;
mod repository;

pub use model::{OutboxMutationDB, SyncEngineStateDB};
pub use repository::{discard_outbox_mutations, write_outbox_mutation, OutboxRepository};
