//! Error types shared by every layer of the sync engine.

use std::time::Duration;

use thiserror::Error;

use crate::entities::EntityType;
use crate::sync::RemoteErrorKind;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the local store, the outbox, the sync manager and the data manager.
#[derive(Debug, Error)]
pub enum Error {
    /// The durable store itself is broken. Never retried internally.
    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    /// Expected while offline; triggers the cache fallback.
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// The remote authority answered with a machine-readable rejection.
    #[error("Remote rejected request ({kind}, status {status}): {message}")]
    RemoteRejected {
        kind: RemoteErrorKind,
        status: u16,
        message: String,
    },

    #[error("Remote call timed out after {0:?}")]
    Timeout(Duration),

    /// Neither the cache nor the remote authority know the entity.
    #[error("{entity_type} '{id}' not found")]
    NotFound { entity_type: EntityType, id: String },

    /// The entity is not cached and the remote authority could not be reached.
    #[error("{entity_type} '{id}' is not cached and the remote is unreachable")]
    Unavailable { entity_type: EntityType, id: String },

    #[error("Mutation {mutation_id} dead-lettered after {attempts} attempts")]
    MaxRetriesExceeded { mutation_id: String, attempts: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageIo(message.into())
    }

    /// Create an invalid payload error
    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload(message.into())
    }

    /// Whether the caller may fall back to cached data.
    pub fn is_offline_fallback(&self) -> bool {
        matches!(
            self,
            Self::NetworkUnavailable
                | Self::Timeout(_)
                | Self::RemoteRejected {
                    kind: RemoteErrorKind::ServerError,
                    ..
                }
        )
    }
}
