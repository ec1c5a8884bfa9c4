//! Contract of the remote system of record, as consumed by the sync engine.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PendingMutation;
use crate::entities::EntityType;
use crate::errors::Error;

/// Machine-readable rejection kinds returned by the remote authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorKind {
    Conflict,
    NotFound,
    Validation,
    ServerError,
}

impl std::fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RemoteErrorKind::Conflict => "conflict",
            RemoteErrorKind::NotFound => "not_found",
            RemoteErrorKind::Validation => "validation",
            RemoteErrorKind::ServerError => "server_error",
        };
        f.write_str(name)
    }
}

/// Classify an HTTP status into a rejection kind.
pub fn classify_http_status(status: u16) -> RemoteErrorKind {
    match status {
        409 | 412 => RemoteErrorKind::Conflict,
        404 | 410 => RemoteErrorKind::NotFound,
        408 | 425 | 429 => RemoteErrorKind::ServerError,
        500..=599 => RemoteErrorKind::ServerError,
        _ => RemoteErrorKind::Validation,
    }
}

/// Current state of an entity on the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntity {
    pub id: String,
    pub payload: serde_json::Value,
    pub server_version: String,
}

/// Failures talking to the remote authority.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    #[error("Remote unreachable: {0}")]
    Unavailable(String),

    #[error("Remote call timed out")]
    Timeout,

    /// `current` carries the server copy when the rejection is a conflict and the server sent it.
    #[error("Remote rejected ({kind}, status {status}): {message}")]
    Rejected {
        kind: RemoteErrorKind,
        status: u16,
        message: String,
        current: Option<RemoteEntity>,
    },
}

impl RemoteError {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            kind: classify_http_status(status),
            status,
            message: message.into(),
            current: None,
        }
    }

    pub fn conflict(message: impl Into<String>, current: Option<RemoteEntity>) -> Self {
        Self::Rejected {
            kind: RemoteErrorKind::Conflict,
            status: 409,
            message: message.into(),
            current,
        }
    }

    pub fn kind(&self) -> Option<RemoteErrorKind> {
        match self {
            Self::Rejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Network loss, timeouts and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::Timeout => true,
            Self::Rejected { kind, .. } => *kind == RemoteErrorKind::ServerError,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == Some(RemoteErrorKind::Conflict)
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable(_) => Error::NetworkUnavailable,
            // The caller's configured timeout is not known here.
            RemoteError::Timeout => Error::Timeout(std::time::Duration::ZERO),
            RemoteError::Rejected {
                kind,
                status,
                message,
                ..
            } => Error::RemoteRejected {
                kind,
                status,
                message,
            },
        }
    }
}

/// The remote system of record.
///
/// Implementations translate operations into transport calls; they never retry on their own.
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    async fn fetch(&self, entity_type: EntityType, id: &str) -> Result<RemoteEntity, RemoteError>;

    async fn list(
        &self,
        entity_type: EntityType,
        filters: &[(String, serde_json::Value)],
    ) -> Result<Vec<RemoteEntity>, RemoteError>;

    /// Applies one outbox mutation against `base_version`. Deletes acknowledge with the
    /// last server state of the entity.
    async fn send(
        &self,
        mutation: &PendingMutation,
        base_version: Option<&str>,
    ) -> Result<RemoteEntity, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_http_status_for_mutation_policy() {
        assert_eq!(classify_http_status(409), RemoteErrorKind::Conflict);
        assert_eq!(classify_http_status(404), RemoteErrorKind::NotFound);
        assert_eq!(classify_http_status(422), RemoteErrorKind::Validation);
        assert_eq!(classify_http_status(429), RemoteErrorKind::ServerError);
        assert_eq!(classify_http_status(503), RemoteErrorKind::ServerError);
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(RemoteError::Timeout.is_transient());
        assert!(RemoteError::Unavailable("dns".to_string()).is_transient());
        assert!(RemoteError::rejected(502, "bad gateway").is_transient());
        assert!(!RemoteError::rejected(400, "bad field").is_transient());
        assert!(!RemoteError::conflict("stale", None).is_transient());
        assert!(RemoteError::conflict("stale", None).is_conflict());
    }

    #[test]
    fn remote_error_maps_to_core_kinds() {
        assert!(matches!(
            Error::from(RemoteError::Unavailable("offline".to_string())),
            Error::NetworkUnavailable
        ));
        assert!(matches!(
            Error::from(RemoteError::rejected(404, "gone")),
            Error::RemoteRejected {
                kind: RemoteErrorKind::NotFound,
                status: 404,
                ..
            }
        ));
    }
}
