//! HTTP client for the remote system of record.

mod client;
mod error;
mod types;

pub use client::{HttpRemoteClient, DEFAULT_TIMEOUT_SECS};
pub use error::{RemoteClientError, Result};
pub use types::{ApiErrorResponse, EntityResponse};
