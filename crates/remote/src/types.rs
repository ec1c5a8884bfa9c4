//! Wire types of the entity endpoints.

use serde::{Deserialize, Serialize};

use fieldsync_core::sync::{RemoteEntity, RemoteErrorKind};

/// Success body of every entity endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityResponse {
    pub id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub server_version: String,
}

impl From<EntityResponse> for RemoteEntity {
    fn from(value: EntityResponse) -> Self {
        RemoteEntity {
            id: value.id,
            payload: value.payload,
            server_version: value.server_version,
        }
    }
}

/// Error body. `kind` may be absent on proxies and gateways; the status decides then.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    #[serde(default)]
    pub kind: Option<RemoteErrorKind>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub current: Option<EntityResponse>,
}
