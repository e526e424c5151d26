//! Pub/Sub REST transport.
//!
//! Speaks `POST {endpoint}/v1/{topic}:publish` with a bearer token. Errors
//! are classified from the JSON `error.status` name when present and from the
//! HTTP status otherwise; connection failures count as `UNAVAILABLE`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{PublishTransport, SinkStatus, TransportError};
use crate::record::PublishRequest;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Wire form of one message in a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubsubMessage {
    /// Base64-encoded payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordering_key: Option<String>,
}

impl From<&PublishRequest> for PubsubMessage {
    fn from(request: &PublishRequest) -> Self {
        Self {
            data: STANDARD.encode(&request.payload),
            attributes: request.attributes.clone(),
            ordering_key: request.ordering_key.clone(),
        }
    }
}

#[derive(Serialize)]
struct PublishBody<'a> {
    messages: &'a [PubsubMessage],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: Option<String>,
}

/// Supplies the bearer token for each request.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `None` sends the request without an `Authorization` header.
    async fn token(&self) -> Result<Option<String>, TransportError>;
}

/// A fixed token, or none at all (emulator).
#[derive(Debug, Clone, Default)]
pub struct StaticTokenProvider {
    token: Option<String>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }

    /// Read `GOOGLE_OAUTH_ACCESS_TOKEN` if set.
    pub fn from_env() -> Self {
        Self {
            token: std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN")
                .ok()
                .filter(|t| !t.is_empty()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.token.is_none()
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self) -> Result<Option<String>, TransportError> {
        Ok(self.token.clone())
    }
}

#[derive(Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

/// Fetches service-account tokens from the GCE metadata server and caches
/// them until shortly before expiry.
pub struct MetadataTokenProvider {
    client: Client,
    url: String,
    cached: Mutex<Option<(String, Instant)>>,
}

impl MetadataTokenProvider {
    pub fn new() -> Self {
        Self::with_url(METADATA_TOKEN_URL)
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            url: url.into(),
            cached: Mutex::new(None),
        }
    }
}

impl Default for MetadataTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenProvider for MetadataTokenProvider {
    async fn token(&self) -> Result<Option<String>, TransportError> {
        let mut cached = self.cached.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if Instant::now() < *expires_at {
                return Ok(Some(token.clone()));
            }
        }

        let response = self
            .client
            .get(&self.url)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        if !response.status().is_success() {
            let status = response.status();
            return Err(TransportError::new(
                SinkStatus::Unauthenticated,
                format!("metadata server returned HTTP {}", status.as_u16()),
            ));
        }
        let token: MetadataToken = response.json().await.map_err(|e| {
            TransportError::new(SinkStatus::Unauthenticated, format!("bad token response: {e}"))
        })?;

        // Refresh a minute early.
        let ttl = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some((token.access_token.clone(), Instant::now() + ttl));
        Ok(Some(token.access_token))
    }
}

/// [`PublishTransport`] over the Pub/Sub REST API.
pub struct RestTransport {
    client: Client,
    endpoint: String,
    tokens: Arc<dyn TokenProvider>,
}

impl RestTransport {
    pub fn new(endpoint: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self::with_client(client, endpoint, tokens)
    }

    pub fn with_client(
        client: Client,
        endpoint: impl Into<String>,
        tokens: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            tokens,
        }
    }

    fn publish_url(&self, topic: &str) -> String {
        format!("{}/v1/{}:publish", self.endpoint, topic)
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> TransportError {
    let status = if err.is_timeout() {
        SinkStatus::DeadlineExceeded
    } else if let Some(code) = err.status() {
        SinkStatus::from_http(code.as_u16())
    } else {
        SinkStatus::Unavailable
    };
    TransportError::new(status, err.to_string())
}

fn classify_error_body(http: u16, body: &str) -> TransportError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let status = envelope
                .error
                .status
                .as_deref()
                .map(SinkStatus::from_code_name)
                .filter(|s| *s != SinkStatus::Other)
                .unwrap_or_else(|| SinkStatus::from_http(http));
            TransportError::new(status, envelope.error.message)
        }
        Err(_) => TransportError::new(SinkStatus::from_http(http), format!("HTTP {http}: {body}")),
    }
}

#[async_trait]
impl PublishTransport for RestTransport {
    async fn publish(
        &self,
        topic: &str,
        messages: &[PublishRequest],
    ) -> Result<Vec<String>, TransportError> {
        let wire: Vec<PubsubMessage> = messages.iter().map(PubsubMessage::from).collect();
        let url = self.publish_url(topic);

        let mut request = self
            .client
            .post(&url)
            .json(&PublishBody { messages: &wire });
        if let Some(token) = self.tokens.token().await? {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_reqwest_error)?;
        let http = response.status();
        if !http.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_error_body(http.as_u16(), &body);
            warn!(topic, status = %err.status, http = http.as_u16(), "Publish request failed");
            return Err(err);
        }

        let parsed: PublishResponse = response.json().await.map_err(|e| {
            TransportError::new(SinkStatus::Internal, format!("bad publish response: {e}"))
        })?;
        if parsed.message_ids.len() != messages.len() {
            return Err(TransportError::new(
                SinkStatus::Internal,
                format!(
                    "expected {} message ids, got {}",
                    messages.len(),
                    parsed.message_ids.len()
                ),
            ));
        }
        debug!(topic, count = messages.len(), "Published batch");
        Ok(parsed.message_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::response::IntoResponse;
    use axum::{Json, Router};
    use serde_json::{json, Value};

    #[derive(Clone, Default)]
    struct Captured {
        requests: Arc<StdMutex<Vec<(String, Option<String>, Value)>>>,
        fail_with: Arc<StdMutex<Option<(StatusCode, Value)>>>,
    }

    async fn handle(
        State(captured): State<Captured>,
        uri: Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> axum::response::Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let count = body["messages"].as_array().map_or(0, |m| m.len());
        captured
            .requests
            .lock()
            .unwrap()
            .push((uri.path().to_string(), auth, body));

        if let Some((code, error)) = captured.fail_with.lock().unwrap().clone() {
            return (code, Json(error)).into_response();
        }
        let ids: Vec<String> = (0..count).map(|i| format!("id-{i}")).collect();
        Json(json!({ "messageIds": ids })).into_response()
    }

    async fn serve(captured: Captured) -> String {
        let app = Router::new().fallback(handle).with_state(captured);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    // ---------------------------------------------------------------
    // Wire format
    // ---------------------------------------------------------------

    #[test]
    fn test_message_encoding() {
        let mut req = PublishRequest::new("hello");
        req.attributes.insert("a".to_string(), "1".to_string());
        req.ordering_key = Some("k".to_string());
        let msg = PubsubMessage::from(&req);
        assert_eq!(msg.data, "aGVsbG8=");

        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["orderingKey"], "k");
        assert_eq!(value["attributes"]["a"], "1");

        let bare = serde_json::to_value(PubsubMessage::from(&PublishRequest::new(""))).unwrap();
        assert!(bare.get("orderingKey").is_none());
        assert!(bare.get("attributes").is_none());
    }

    #[test]
    fn test_error_body_classification() {
        let body = r#"{"error":{"code":404,"message":"Resource not found","status":"NOT_FOUND"}}"#;
        let err = classify_error_body(404, body);
        assert_eq!(err.status, SinkStatus::NotFound);
        assert_eq!(err.message, "Resource not found");

        let err = classify_error_body(503, "upstream connect error");
        assert_eq!(err.status, SinkStatus::Unavailable);
    }

    // ---------------------------------------------------------------
    // HTTP round trips
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn test_publish_posts_to_topic_with_token() {
        let captured = Captured::default();
        let endpoint = serve(captured.clone()).await;
        let transport = RestTransport::new(endpoint, Arc::new(StaticTokenProvider::new("tok")));

        let ids = transport
            .publish(
                "projects/p/topics/t",
                &[PublishRequest::new("a"), PublishRequest::new("b")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec!["id-0", "id-1"]);

        let requests = captured.requests.lock().unwrap();
        let (path, auth, body) = &requests[0];
        assert_eq!(path, "/v1/projects/p/topics/t:publish");
        assert_eq!(auth.as_deref(), Some("Bearer tok"));
        assert_eq!(body["messages"][1]["data"], "Yg==");
    }

    #[tokio::test]
    async fn test_anonymous_sends_no_authorization() {
        let captured = Captured::default();
        let endpoint = serve(captured.clone()).await;
        let transport = RestTransport::new(endpoint, Arc::new(StaticTokenProvider::anonymous()));
        transport
            .publish("projects/p/topics/t", &[PublishRequest::new("a")])
            .await
            .unwrap();
        assert!(captured.requests.lock().unwrap()[0].1.is_none());
    }

    #[tokio::test]
    async fn test_error_status_from_body() {
        let captured = Captured::default();
        *captured.fail_with.lock().unwrap() = Some((
            StatusCode::FORBIDDEN,
            json!({"error": {"code": 403, "message": "denied", "status": "PERMISSION_DENIED"}}),
        ));
        let endpoint = serve(captured.clone()).await;
        let transport = RestTransport::new(endpoint, Arc::new(StaticTokenProvider::anonymous()));

        let err = transport
            .publish("projects/p/topics/t", &[PublishRequest::new("a")])
            .await
            .unwrap_err();
        assert_eq!(err.status, SinkStatus::PermissionDenied);
        assert!(err.status.is_auth());
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = RestTransport::new(
            format!("http://{addr}"),
            Arc::new(StaticTokenProvider::anonymous()),
        );
        let err = transport
            .publish("projects/p/topics/t", &[PublishRequest::new("a")])
            .await
            .unwrap_err();
        assert_eq!(err.status, SinkStatus::Unavailable);
        assert!(err.status.is_retryable());
    }
}
