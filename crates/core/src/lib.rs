//! Offline-first sync engine core.
//!
//! Domain models, storage and remote contracts, the outbox, the sync manager and the entity
//! data manager. Storage and transport live in their own crates behind the traits defined here.

pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod network;
pub mod sync;

pub use errors::{Error, Result};
