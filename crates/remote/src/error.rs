//! Error types for the remote client.

use thiserror::Error;

use fieldsync_core::sync::{classify_http_status, RemoteEntity, RemoteError, RemoteErrorKind};

/// Result type alias for remote client operations.
pub type Result<T> = std::result::Result<T, RemoteClientError>;

#[derive(Debug, Error)]
pub enum RemoteClientError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API error response from the remote authority
    #[error("API error ({status}, {kind}): {message}")]
    Api {
        status: u16,
        kind: RemoteErrorKind,
        message: String,
        current: Option<RemoteEntity>,
    },

    /// Invalid request (bad base URL, unusable header value, etc.)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteClientError {
    /// Create an API error; the kind falls back to the status classification.
    pub fn api(status: u16, kind: Option<RemoteErrorKind>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            kind: kind.unwrap_or_else(|| classify_http_status(status)),
            message: message.into(),
            current: None,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

impl From<RemoteClientError> for RemoteError {
    fn from(err: RemoteClientError) -> Self {
        match err {
            RemoteClientError::Http(err) if err.is_timeout() => RemoteError::Timeout,
            RemoteClientError::Http(err) => RemoteError::Unavailable(err.to_string()),
            RemoteClientError::Api {
                status,
                kind,
                message,
                current,
            } => RemoteError::Rejected {
                kind,
                status,
                message,
                current,
            },
            RemoteClientError::Json(err) => RemoteError::Rejected {
                kind: RemoteErrorKind::Validation,
                status: 0,
                message: format!("Malformed response: {}", err),
                current: None,
            },
            RemoteClientError::InvalidRequest(message) => RemoteError::Rejected {
                kind: RemoteErrorKind::Validation,
                status: 0,
                message,
                current: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_kind_falls_back_to_status() {
        let remote: RemoteError = RemoteClientError::api(503, None, "maintenance").into();
        assert!(remote.is_transient());
        assert_eq!(remote.kind(), Some(RemoteErrorKind::ServerError));

        let remote: RemoteError =
            RemoteClientError::api(400, Some(RemoteErrorKind::Conflict), "stale").into();
        assert!(remote.is_conflict());
    }

    #[test]
    fn permanent_errors_convert_to_non_transient_rejections() {
        let remote: RemoteError = RemoteClientError::api(422, None, "bad field").into();
        assert!(!remote.is_transient());
        assert_eq!(remote.kind(), Some(RemoteErrorKind::Validation));

        let remote: RemoteError = RemoteClientError::invalid_request("bad header").into();
        assert!(!remote.is_transient());
    }
}
