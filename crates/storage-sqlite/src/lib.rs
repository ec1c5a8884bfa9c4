//! SQLite realisation of the durable local store and the outbox.

pub mod db;
pub mod errors;
pub mod outbox;
pub mod records;
pub mod schema;

pub use db::{create_pool, get_connection, init, open, run_migrations, DbPool, WriteHandle};
pub use errors::StorageError;
pub use outbox::OutboxRepository;
pub use records::RecordRepository;
