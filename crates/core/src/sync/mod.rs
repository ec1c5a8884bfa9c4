//! Outbox, conflict policies and the sync manager.

mod backoff;
mod conflict;
mod outbox;
mod remote;
mod sync_manager;
mod sync_model;

pub use backoff::*;
pub use conflict::*;
pub use outbox::*;
pub use remote::*;
pub use sync_manager::*;
pub use sync_model::*;
