//! HTTP client for the entity endpoints of the remote system of record.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderValue, IF_MATCH};
use reqwest::{Method, StatusCode, Url};

use fieldsync_core::entities::EntityType;
use fieldsync_core::sync::{
    MutationOperation, PendingMutation, RemoteAuthority, RemoteEntity, RemoteError,
};

use crate::error::{RemoteClientError, Result};
use crate::types::{ApiErrorResponse, EntityResponse};

/// Default timeout for API requests.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_LOG_BODY_CHARS: usize = 512;

/// Client for the remote entity API.
///
/// Each entity type lives under its own path (`missions`, `checklist-entries`). The client
/// never retries; the sync engine owns retry policy.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpRemoteClient {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("[Remote] Response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[Remote] Response error ({}): {}", status, preview);
    }

    /// Create a client with the default request timeout.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the entity API (e.g., "https://api.example.org/v1")
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url.trim_end_matches('/')).map_err(|e| {
            RemoteClientError::invalid_request(format!("Invalid base URL '{}': {}", base_url, e))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(RemoteClientError::invalid_request(format!(
                "Base URL '{}' cannot carry entity paths",
                base_url
            )));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// `{base}/{partition}` or `{base}/{partition}/{id}`, with path segments escaped.
    fn endpoint(&self, entity_type: EntityType, id: Option<&str>) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                RemoteClientError::invalid_request("Base URL cannot carry entity paths")
            })?;
            segments.pop_if_empty().push(entity_type.partition());
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    fn read_error(status: StatusCode, body: &str) -> RemoteClientError {
        match serde_json::from_str::<ApiErrorResponse>(body) {
            Ok(error) => {
                let mut err = RemoteClientError::api(status.as_u16(), error.kind, error.message);
                if let RemoteClientError::Api { current, .. } = &mut err {
                    *current = error.current.map(RemoteEntity::from);
                }
                err
            }
            Err(_) => RemoteClientError::api(
                status.as_u16(),
                None,
                format!("Request failed: {}", body),
            ),
        }
    }

    /// Parse an entity body, or the error body for non-success statuses.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if !status.is_success() {
            return Err(Self::read_error(status, &body));
        }

        serde_json::from_str(&body).map_err(|e| {
            log::error!(
                "[Remote] Failed to deserialize response. Body: {}, Error: {}",
                body,
                e
            );
            RemoteClientError::Json(e)
        })
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entity endpoints
    // ─────────────────────────────────────────────────────────────────────────

    /// GET /{path}/{id}
    pub async fn get_entity(&self, entity_type: EntityType, id: &str) -> Result<EntityResponse> {
        let url = self.endpoint(entity_type, Some(id))?;
        debug!("[Remote] GET {}", url);

        let response = self.client.get(url).send().await?;
        Self::parse_response(response).await
    }

    /// GET /{path}?field=value
    pub async fn list_entities(
        &self,
        entity_type: EntityType,
        filters: &[(String, serde_json::Value)],
    ) -> Result<Vec<EntityResponse>> {
        let mut url = self.endpoint(entity_type, None)?;
        if !filters.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in filters {
                match value {
                    serde_json::Value::String(text) => query.append_pair(name, text),
                    other => query.append_pair(name, &other.to_string()),
                };
            }
        }
        debug!("[Remote] GET {}", url);

        let response = self.client.get(url).send().await?;
        Self::parse_response(response).await
    }

    /// POST /{path}, PATCH /{path}/{id} or DELETE /{path}/{id}.
    ///
    /// Update and delete carry `If-Match: <base_version>` when a base version is known.
    /// A delete answered without a body acknowledges with the base version.
    pub async fn send_mutation(
        &self,
        mutation: &PendingMutation,
        base_version: Option<&str>,
    ) -> Result<EntityResponse> {
        let (method, url) = match mutation.operation {
            MutationOperation::Create => (Method::POST, self.endpoint(mutation.entity_type, None)?),
            MutationOperation::Update => (
                Method::PATCH,
                self.endpoint(mutation.entity_type, Some(&mutation.entity_id))?,
            ),
            MutationOperation::Delete => (
                Method::DELETE,
                self.endpoint(mutation.entity_type, Some(&mutation.entity_id))?,
            ),
        };
        debug!("[Remote] {} {} (mutation {})", method, url, mutation.id);

        let mut request = self.client.request(method, url);
        if mutation.operation != MutationOperation::Create {
            if let Some(version) = base_version {
                let value = HeaderValue::from_str(version).map_err(|_| {
                    RemoteClientError::invalid_request(format!(
                        "Invalid base version '{}'",
                        version
                    ))
                })?;
                request = request.header(IF_MATCH, value);
            }
        }
        if mutation.operation != MutationOperation::Delete {
            request = request.json(&mutation.payload);
        }

        let response = request.send().await?;
        if mutation.operation == MutationOperation::Delete
            && response.status() == StatusCode::NO_CONTENT
        {
            Self::log_response(StatusCode::NO_CONTENT, "");
            return Ok(EntityResponse {
                id: mutation.entity_id.clone(),
                payload: serde_json::Value::Null,
                server_version: base_version.unwrap_or_default().to_string(),
            });
        }
        Self::parse_response(response).await
    }
}

#[async_trait]
impl RemoteAuthority for HttpRemoteClient {
    async fn fetch(
        &self,
        entity_type: EntityType,
        id: &str,
    ) -> std::result::Result<RemoteEntity, RemoteError> {
        Ok(self.get_entity(entity_type, id).await?.into())
    }

    async fn list(
        &self,
        entity_type: EntityType,
        filters: &[(String, serde_json::Value)],
    ) -> std::result::Result<Vec<RemoteEntity>, RemoteError> {
        Ok(self
            .list_entities(entity_type, filters)
            .await?
            .into_iter()
            .map(RemoteEntity::from)
            .collect())
    }

    async fn send(
        &self,
        mutation: &PendingMutation,
        base_version: Option<&str>,
    ) -> std::result::Result<RemoteEntity, RemoteError> {
        Ok(self.send_mutation(mutation, base_version).await?.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldsync_core::sync::{OutboxStatus, RemoteErrorKind};
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex as TokioMutex;

    fn mutation(
        operation: MutationOperation,
        entity_id: &str,
        payload: serde_json::Value,
    ) -> PendingMutation {
        PendingMutation {
            id: "mut-1".to_string(),
            seq: 1,
            entity_type: EntityType::Mission,
            entity_id: entity_id.to_string(),
            operation,
            payload,
            base_version: None,
            status: OutboxStatus::Pending,
            created_at: Default::default(),
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            next_retry_at: None,
        }
    }

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        request_line: String,
        headers: HashMap<String, String>,
        body: String,
    }

    #[derive(Debug, Clone)]
    struct MockResponse {
        status: u16,
        body: String,
        delay_ms: u64,
    }

    fn respond(status: u16, body: serde_json::Value) -> MockResponse {
        MockResponse {
            status,
            body: body.to_string(),
            delay_ms: 0,
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        loop {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
            if header_end_offset(&buffer).is_some() {
                break;
            }
        }

        let header_end = header_end_offset(&buffer)?;
        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.lines();
        let request_line = lines.next()?.to_string();

        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }

        let content_length = headers
            .get("content-length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = buffer[header_end + 4..].to_vec();
        while body.len() < content_length {
            let mut chunk = [0_u8; 2048];
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..read]);
        }

        Some(CapturedRequest {
            request_line,
            headers,
            body: String::from_utf8_lossy(&body).to_string(),
        })
    }

    fn status_text(status: u16) -> &'static str {
        match status {
            200 => "OK",
            201 => "Created",
            204 => "No Content",
            404 => "Not Found",
            409 => "Conflict",
            422 => "Unprocessable Entity",
            503 => "Service Unavailable",
            _ => "Error",
        }
    }

    async fn write_http_response(
        stream: &mut tokio::net::TcpStream,
        status: u16,
        body: &str,
    ) -> std::io::Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            status_text(status),
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await
    }

    async fn start_mock_server(
        responses: Vec<MockResponse>,
    ) -> (String, Arc<TokioMutex<Vec<CapturedRequest>>>) {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("listener addr");
        let captured = Arc::new(TokioMutex::new(Vec::<CapturedRequest>::new()));
        let scripted = Arc::new(TokioMutex::new(VecDeque::from(responses)));
        let captured_clone = Arc::clone(&captured);

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let captured_inner = Arc::clone(&captured_clone);
                let scripted_inner = Arc::clone(&scripted);
                tokio::spawn(async move {
                    let Some(request) = read_http_request(&mut stream).await else {
                        return;
                    };
                    captured_inner.lock().await.push(request);
                    let response = scripted_inner
                        .lock()
                        .await
                        .pop_front()
                        .unwrap_or_else(|| {
                            respond(500, json!({ "kind": "server_error", "message": "unexpected" }))
                        });
                    if response.delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(response.delay_ms)).await;
                    }
                    let _ = write_http_response(&mut stream, response.status, &response.body).await;
                });
            }
        });

        (format!("http://{}", addr), captured)
    }

    #[tokio::test]
    async fn fetch_reads_entity_from_typed_endpoint() {
        let (base_url, captured) = start_mock_server(vec![respond(
            200,
            json!({ "id": "m 1", "payload": { "status": "open" }, "serverVersion": "v3" }),
        )])
        .await;
        let client = HttpRemoteClient::new(&base_url).unwrap();

        let entity = client.fetch(EntityType::Mission, "m 1").await.unwrap();
        assert_eq!(entity.server_version, "v3");
        assert_eq!(entity.payload, json!({ "status": "open" }));

        let requests = captured.lock().await;
        assert_eq!(requests[0].request_line, "GET /missions/m%201 HTTP/1.1");
    }

    #[tokio::test]
    async fn list_passes_filters_as_query() {
        let (base_url, captured) = start_mock_server(vec![respond(200, json!([]))]).await;
        let client = HttpRemoteClient::new(&format!("{}/v1/", base_url)).unwrap();

        let entities = client
            .list(
                EntityType::ChecklistEntry,
                &[("missionId".to_string(), json!("m1"))],
            )
            .await
            .unwrap();
        assert!(entities.is_empty());

        let requests = captured.lock().await;
        assert_eq!(
            requests[0].request_line,
            "GET /v1/checklist-entries?missionId=m1 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn update_sends_patch_with_base_version() {
        let (base_url, captured) = start_mock_server(vec![respond(
            200,
            json!({ "id": "m1", "payload": { "status": "done" }, "serverVersion": "v4" }),
        )])
        .await;
        let client = HttpRemoteClient::new(&base_url).unwrap();
        let update = mutation(MutationOperation::Update, "m1", json!({ "status": "done" }));

        let ack = client.send(&update, Some("v3")).await.unwrap();
        assert_eq!(ack.server_version, "v4");

        let requests = captured.lock().await;
        assert_eq!(requests[0].request_line, "PATCH /missions/m1 HTTP/1.1");
        assert_eq!(requests[0].headers.get("if-match").map(String::as_str), Some("v3"));
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body, json!({ "status": "done" }));
    }

    #[tokio::test]
    async fn conflict_carries_server_copy() {
        let (base_url, _) = start_mock_server(vec![respond(
            409,
            json!({
                "kind": "conflict",
                "message": "stale version",
                "current": { "id": "m1", "payload": { "status": "completed" }, "serverVersion": "v5" }
            }),
        )])
        .await;
        let client = HttpRemoteClient::new(&base_url).unwrap();
        let update = mutation(MutationOperation::Update, "m1", json!({ "status": "open" }));

        let err = client.send(&update, Some("v3")).await.unwrap_err();
        let RemoteError::Rejected {
            kind,
            status,
            current,
            ..
        } = err
        else {
            panic!("expected rejection, got {err:?}");
        };
        assert_eq!(kind, RemoteErrorKind::Conflict);
        assert_eq!(status, 409);
        assert_eq!(current.unwrap().server_version, "v5");
    }

    #[tokio::test]
    async fn delete_without_body_acknowledges_with_base_version() {
        let (base_url, captured) = start_mock_server(vec![MockResponse {
            status: 204,
            body: String::new(),
            delay_ms: 0,
        }])
        .await;
        let client = HttpRemoteClient::new(&base_url).unwrap();
        let delete = mutation(MutationOperation::Delete, "m1", serde_json::Value::Null);

        let ack = client.send(&delete, Some("v7")).await.unwrap();
        assert_eq!(ack.id, "m1");
        assert_eq!(ack.server_version, "v7");
        assert_eq!(
            captured.lock().await[0].request_line,
            "DELETE /missions/m1 HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn status_without_error_body_is_classified() {
        let (base_url, _) = start_mock_server(vec![
            MockResponse {
                status: 503,
                body: "upstream down".to_string(),
                delay_ms: 0,
            },
            respond(404, json!({ "message": "no such mission" })),
            respond(422, json!({ "kind": "validation", "message": "bad status" })),
        ])
        .await;
        let client = HttpRemoteClient::new(&base_url).unwrap();

        let unavailable = client.fetch(EntityType::Mission, "m1").await.unwrap_err();
        assert!(unavailable.is_transient());

        let missing = client.fetch(EntityType::Mission, "m1").await.unwrap_err();
        assert_eq!(missing.kind(), Some(RemoteErrorKind::NotFound));

        let create = mutation(MutationOperation::Create, "m1", json!({ "id": "m1" }));
        let invalid = client.send(&create, None).await.unwrap_err();
        assert_eq!(invalid.kind(), Some(RemoteErrorKind::Validation));
        assert!(!invalid.is_transient());
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let (base_url, _) = start_mock_server(vec![MockResponse {
            status: 200,
            body: json!({ "id": "m1", "payload": {}, "serverVersion": "v1" }).to_string(),
            delay_ms: 500,
        }])
        .await;
        let client = HttpRemoteClient::with_timeout(&base_url, Duration::from_millis(100)).unwrap();

        let err = client.fetch(EntityType::Mission, "m1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn refused_connection_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = HttpRemoteClient::new(&format!("http://{}", addr)).unwrap();

        let err = client.fetch(EntityType::Mission, "m1").await.unwrap_err();
        assert!(matches!(err, RemoteError::Unavailable(_)), "got {err:?}");
    }

    #[test]
    fn rejects_unusable_base_url() {
        assert!(HttpRemoteClient::new("not a url").is_err());
        assert!(HttpRemoteClient::new("mailto:ops@example.org").is_err());
    }
}
