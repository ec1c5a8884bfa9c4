//! Offline-first entity access for field devices.
//!
//! [`ServiceContext`] wires the local store, the outbox, the sync manager and the entity
//! data manager once at process start.

pub mod config;
pub mod context;

pub use config::AppConfig;
pub use context::ServiceContext;

pub use fieldsync_core::{Error, Result};
