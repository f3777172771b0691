//! HTTP transport for the collection service
//!
//! This module provides the batch transport that:
//! - Wraps payloads in the `{data: ...}` envelope and authenticates with the session token
//! - Classifies failures into network, auth, server, validation, timeout and unknown
//! - Refreshes the session through the coordinator and retries once on auth failures
//! - Logs failures with credentials redacted

use crate::config::{ConfigError, TransportConfig};
use crate::models::IngestAck;
use crate::observability::SyncMetrics;
use crate::session::RefreshCoordinator;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Longest payload excerpt written to failure logs
const LOGGED_PAYLOAD_CHARS: usize = 512;

/// Keys whose values never reach the logs
const SENSITIVE_KEY_PARTS: &[&str] = &["token", "secret", "password", "authorization"];

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Auth,
    Server,
    Validation,
    Timeout,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Auth => "auth",
            ErrorKind::Server => "server",
            ErrorKind::Validation => "validation",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Error returned by a transport call
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no response from {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    #[error("authentication rejected by {endpoint} (status {status})")]
    Auth { endpoint: String, status: u16 },

    /// Refresh failed or there was no session to refresh
    #[error("session expired, sign in again")]
    SessionExpired,

    #[error("server error from {endpoint} (status {status}): {message}")]
    Server {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("request to {endpoint} rejected (status {status}): {message}")]
    Validation {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("request to {endpoint} timed out")]
    Timeout { endpoint: String },

    #[error("request to {endpoint} failed: {message}")]
    Unknown { endpoint: String, message: String },
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Network { .. } => ErrorKind::Network,
            TransportError::Auth { .. } | TransportError::SessionExpired => ErrorKind::Auth,
            TransportError::Server { .. } => ErrorKind::Server,
            TransportError::Validation { .. } => ErrorKind::Validation,
            TransportError::Timeout { .. } => ErrorKind::Timeout,
            TransportError::Unknown { .. } => ErrorKind::Unknown,
        }
    }

    fn from_status(endpoint: &str, status: u16, body: String) -> Self {
        let endpoint = endpoint.to_string();
        match classify_status(status, &body) {
            ErrorKind::Auth => TransportError::Auth { endpoint, status },
            ErrorKind::Server => TransportError::Server {
                endpoint,
                status,
                message: body,
            },
            ErrorKind::Validation => TransportError::Validation {
                endpoint,
                status,
                message: body,
            },
            ErrorKind::Timeout => TransportError::Timeout { endpoint },
            ErrorKind::Network | ErrorKind::Unknown => TransportError::Unknown {
                endpoint,
                message: format!("unexpected status {}: {}", status, body),
            },
        }
    }

    fn from_reqwest(endpoint: &str, error: reqwest::Error) -> Self {
        let endpoint = endpoint.to_string();
        if error.is_timeout() {
            TransportError::Timeout { endpoint }
        } else if error.is_connect() || error.is_request() {
            TransportError::Network {
                endpoint,
                message: error.to_string(),
            }
        } else {
            TransportError::Unknown {
                endpoint,
                message: error.to_string(),
            }
        }
    }
}

/// Classify a non-success HTTP status.
///
/// The service answers unknown or expired access tokens with 403 and a
/// detail of "invalid token" / "token expired", so those 403s are auth
/// failures too.
pub fn classify_status(status: u16, body: &str) -> ErrorKind {
    match status {
        401 => ErrorKind::Auth,
        403 => {
            let body = body.to_ascii_lowercase();
            if body.contains("invalid token") || body.contains("token expired") {
                ErrorKind::Auth
            } else {
                ErrorKind::Validation
            }
        }
        408 => ErrorKind::Timeout,
        500..=599 => ErrorKind::Server,
        400..=499 => ErrorKind::Validation,
        _ => ErrorKind::Unknown,
    }
}

/// Copy of `value` with credential-like fields masked
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let redacted: Map<String, Value> = map
                .iter()
                .map(|(key, v)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact(v))
                    }
                })
                .collect();
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key == "refresh" || SENSITIVE_KEY_PARTS.iter().any(|part| key.contains(part))
}

fn payload_excerpt(payload: Option<&Value>) -> String {
    let Some(payload) = payload else {
        return String::new();
    };
    let text = redact(payload).to_string();
    if text.chars().count() > LOGGED_PAYLOAD_CHARS {
        let truncated: String = text.chars().take(LOGGED_PAYLOAD_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text
    }
}

/// Outbound batch submission
#[async_trait]
pub trait Transport: Send + Sync {
    /// Submit `payload` to `endpoint` (relative path such as `sync/steps`)
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<Value, TransportError>;

    /// Delete records remotely by their UUIDs
    async fn delete_records(
        &self,
        record_type: &str,
        _uuids: &[String],
    ) -> Result<Value, TransportError> {
        Err(TransportError::Unknown {
            endpoint: format!("sync/{}", record_type),
            message: "remote deletion is not supported by this transport".to_string(),
        })
    }
}

/// Reachability of the two service health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub api: bool,
    pub ingest: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_status: Option<Value>,
}

/// Build the shared HTTP client
pub fn build_http_client(config: &TransportConfig) -> Result<Client, ConfigError> {
    Client::builder()
        .timeout(config.request_timeout())
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| ConfigError::HttpClient(e.to_string()))
}

/// Parse the base URL, making sure relative joins keep its path
pub fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let mut normalized = raw.trim().to_string();
    if !normalized.ends_with('/') {
        normalized.push('/');
    }
    Url::parse(&normalized).map_err(|e| ConfigError::BaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Authenticated HTTP transport
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    coordinator: Arc<RefreshCoordinator>,
    metrics: SyncMetrics,
}

impl HttpTransport {
    pub fn new(
        config: &TransportConfig,
        coordinator: Arc<RefreshCoordinator>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_client(
            build_http_client(config)?,
            parse_base_url(&config.base_url)?,
            coordinator,
        ))
    }

    /// Create a transport sharing an existing client
    pub fn with_client(client: Client, base_url: Url, coordinator: Arc<RefreshCoordinator>) -> Self {
        Self {
            client,
            base_url,
            coordinator,
            metrics: SyncMetrics::new(),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn coordinator(&self) -> &Arc<RefreshCoordinator> {
        &self.coordinator
    }

    /// Submit a batch to an ingest endpoint and decode its acknowledgement
    pub async fn ingest(&self, record_type: &str, payload: &Value) -> Result<IngestAck, TransportError> {
        let endpoint = format!("ingest/{}", record_type);
        let response = self.send(&endpoint, payload).await?;
        let ack: IngestAck = serde_json::from_value(response).unwrap_or_default();
        debug!(
            record_type = %record_type,
            matched = ack.matched,
            modified = ack.modified,
            upserts = ack.upserts,
            "Ingest acknowledged"
        );
        Ok(ack)
    }

    /// Probe `GET /health` and `GET /ingest/health`
    pub async fn health(&self) -> ServiceHealth {
        let api = self.request_once(Method::GET, "health", None, None).await;
        let ingest = self
            .request_once(Method::GET, "ingest/health", None, None)
            .await;

        ServiceHealth {
            api: api.is_ok(),
            ingest: ingest.is_ok(),
            api_status: api.ok(),
        }
    }

    /// Issue a request, refreshing the session and retrying once on auth failure
    async fn execute(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let token = self.coordinator.access_token().await;

        let first = self
            .request_once(method.clone(), endpoint, body, token.as_deref())
            .await;

        let result = match first {
            Err(TransportError::Auth { .. }) => {
                debug!(endpoint = %endpoint, "Auth failure, refreshing session");
                match self
                    .coordinator
                    .refresh_after_auth_failure(token.as_deref())
                    .await
                {
                    // The retried request is not retried again on a second auth failure
                    Some(refreshed) => {
                        self.request_once(method, endpoint, body, Some(&refreshed))
                            .await
                    }
                    None => Err(TransportError::SessionExpired),
                }
            }
            other => other,
        };

        if let Err(e) = &result {
            self.metrics.inc_transport_failure(e.kind().as_str());
            warn!(
                endpoint = %endpoint,
                kind = e.kind().as_str(),
                error = %e,
                payload = %payload_excerpt(body),
                "Request failed"
            );
        }

        result
    }

    async fn request_once(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
        token: Option<&str>,
    ) -> Result<Value, TransportError> {
        let url = self
            .base_url
            .join(endpoint.trim_start_matches('/'))
            .map_err(|e| TransportError::Unknown {
                endpoint: endpoint.to_string(),
                message: format!("invalid endpoint: {}", e),
            })?;

        let mut request = self.client.request(method, url);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::from_reqwest(endpoint, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::from_reqwest(endpoint, e))?;

        if !status.is_success() {
            return Err(TransportError::from_status(endpoint, status.as_u16(), text));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, endpoint: &str, payload: &Value) -> Result<Value, TransportError> {
        let body = json!({ "data": payload });
        self.execute(Method::POST, endpoint, Some(&body)).await
    }

    async fn delete_records(
        &self,
        record_type: &str,
        uuids: &[String],
    ) -> Result<Value, TransportError> {
        let endpoint = format!("sync/{}", record_type);
        let body = json!({ "uuid": uuids });
        self.execute(Method::DELETE, &endpoint, Some(&body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Session;
    use crate::session::{MemorySessionStore, SessionStore};
    use crate::sync::auth::AuthClient;
    use mockito::{Matcher, Server};

    fn transport_for(server_url: &str, session: Option<Session>) -> HttpTransport {
        let store: Arc<dyn SessionStore> = match session {
            Some(s) => Arc::new(MemorySessionStore::with_session(s)),
            None => Arc::new(MemorySessionStore::new()),
        };
        let config = TransportConfig {
            base_url: server_url.to_string(),
            ..Default::default()
        };
        let client = build_http_client(&config).unwrap();
        let base_url = parse_base_url(server_url).unwrap();
        let auth = Arc::new(AuthClient::new(client.clone(), base_url.clone(), store.clone()));
        let coordinator = Arc::new(RefreshCoordinator::new(store, auth));
        HttpTransport::with_client(client, base_url, coordinator)
    }

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(401, ""), ErrorKind::Auth);
        assert_eq!(
            classify_status(403, r#"{"detail":"invalid token"}"#),
            ErrorKind::Auth
        );
        assert_eq!(
            classify_status(403, r#"{"detail":"token expired. Use /login to reauthenticate."}"#),
            ErrorKind::Auth
        );
        assert_eq!(
            classify_status(403, r#"{"detail":"invalid password"}"#),
            ErrorKind::Validation
        );
        assert_eq!(classify_status(422, ""), ErrorKind::Validation);
        assert_eq!(classify_status(408, ""), ErrorKind::Timeout);
        assert_eq!(classify_status(503, ""), ErrorKind::Server);
        assert_eq!(classify_status(302, ""), ErrorKind::Unknown);
    }

    #[test]
    fn test_redact_masks_nested_credentials() {
        let value = json!({
            "username": "ada",
            "password": "hunter2",
            "refresh": "r-token",
            "nested": [{"accessToken": "abc", "bpm": 72}],
            "pushToken": "fcm"
        });
        let redacted = redact(&value);
        assert_eq!(redacted["username"], "ada");
        assert_eq!(redacted["password"], "[REDACTED]");
        assert_eq!(redacted["refresh"], "[REDACTED]");
        assert_eq!(redacted["pushToken"], "[REDACTED]");
        assert_eq!(redacted["nested"][0]["accessToken"], "[REDACTED]");
        assert_eq!(redacted["nested"][0]["bpm"], 72);
    }

    #[tokio::test]
    async fn test_send_wraps_payload_in_envelope() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/sync/steps")
            .match_header("authorization", "Bearer good")
            .match_body(Matcher::PartialJson(json!({"data": [{"count": 10}]})))
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("good", "r1")));
        let response = transport
            .send("sync/steps", &json!([{"count": 10}]))
            .await
            .unwrap();

        assert_eq!(response["success"], true);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_401s_issue_one_refresh() {
        let mut server = Server::new_async().await;
        let rejected = server
            .mock("POST", "/sync/heartRate")
            .match_header("authorization", "Bearer old")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let accepted = server
            .mock("POST", "/sync/heartRate")
            .match_header("authorization", "Bearer new")
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/refresh")
            .match_body(Matcher::Json(json!({"refresh": "r1"})))
            .with_status(200)
            .with_body(r#"{"token": "new", "refresh": "r1", "expiry": "2030-01-01T00:00:00"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("old", "r1")));
        let payload = json!([{"bpm": 70}]);
        let (a, b) = tokio::join!(
            transport.send("sync/heartRate", &payload),
            transport.send("sync/heartRate", &payload)
        );

        assert!(a.is_ok());
        assert!(b.is_ok());
        refresh.assert_async().await;
        rejected.assert_async().await;
        accepted.assert_async().await;
        assert_eq!(
            transport.coordinator().access_token().await.as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_retried_request_is_not_retried_twice() {
        let mut server = Server::new_async().await;
        let rejected = server
            .mock("POST", "/sync/steps")
            .with_status(401)
            .expect(2)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/refresh")
            .with_status(200)
            .with_body(r#"{"token": "new", "refresh": "r1"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("old", "r1")));
        let err = transport.send("sync/steps", &json!([])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Auth);
        rejected.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rejection_expires_session() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/sync/steps")
            .with_status(403)
            .with_body(r#"{"detail": "token expired. Use /login to reauthenticate."}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/refresh")
            .with_status(403)
            .with_body(r#"{"detail": "invalid refresh token"}"#)
            .expect(1)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("old", "r1")));
        let err = transport.send("sync/steps", &json!([])).await.unwrap_err();

        assert!(matches!(err, TransportError::SessionExpired));
        assert!(transport.coordinator().access_token().await.is_none());
    }

    #[tokio::test]
    async fn test_non_auth_failures_are_not_retried() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("POST", "/ingest/steps")
            .with_status(503)
            .with_body("maintenance")
            .expect(1)
            .create_async()
            .await;
        let refresh = server
            .mock("POST", "/refresh")
            .expect(0)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("good", "r1")));
        let err = transport.send("ingest/steps", &json!([])).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Server);
        failing.assert_async().await;
        refresh.assert_async().await;
    }

    #[tokio::test]
    async fn test_forbidden_without_token_detail_is_validation() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/sync/steps")
            .with_status(403)
            .with_body(r#"{"detail": "not a family member"}"#)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("good", "r1")));
        let err = transport.send("sync/steps", &json!([])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_network_error() {
        let transport = transport_for("http://127.0.0.1:1/", Some(Session::new("t", "r")));
        let err = transport.send("sync/steps", &json!([])).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_ingest_ack_and_delete() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/ingest/steps")
            .with_status(200)
            .with_body(r#"{"ok": true, "matched": 1, "modified": 1, "upserts": 2}"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/sync/steps")
            .match_body(Matcher::Json(json!({"uuid": ["a", "b"]})))
            .with_status(200)
            .with_body(r#"{"success": true}"#)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), Some(Session::new("t", "r")));
        let ack = transport.ingest("steps", &json!([{}])).await.unwrap();
        assert!(ack.ok);
        assert_eq!(ack.upserts, 2);

        transport
            .delete_records("steps", &["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        delete.assert_async().await;
    }

    #[tokio::test]
    async fn test_health_probes_both_endpoints() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status": "healthy"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/ingest/health")
            .with_status(500)
            .create_async()
            .await;

        let transport = transport_for(&server.url(), None);
        let health = transport.health().await;
        assert!(health.api);
        assert!(!health.ingest);
        assert_eq!(health.api_status.unwrap()["status"], "healthy");
    }
}
