//! Sign-in, sign-out and token refresh against the collection service

use crate::models::{Session, TokenResponse};
use crate::session::{SessionError, SessionStore, TokenRefresher};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

/// Talks to `/login`, `/refresh` and `/revoke`
pub struct AuthClient {
    client: Client,
    base_url: Url,
    store: Arc<dyn SessionStore>,
}

impl AuthClient {
    pub fn new(client: Client, base_url: Url, store: Arc<dyn SessionStore>) -> Self {
        Self {
            client,
            base_url,
            store,
        }
    }

    fn url(&self, path: &str) -> Result<Url, SessionError> {
        self.base_url
            .join(path)
            .map_err(|e| SessionError::Request(format!("invalid URL for {}: {}", path, e)))
    }

    /// Sign in and store the issued session
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        push_token: Option<&str>,
    ) -> Result<Session, SessionError> {
        let mut body = json!({ "username": username, "password": password });
        if let Some(push_token) = push_token {
            body["pushToken"] = json!(push_token);
        }

        let response = self
            .client
            .post(self.url("login")?)
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(rejection(status, detail));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Request(format!("malformed login response: {}", e)))?;

        let session = Session::from(tokens);
        self.store.set(session.clone()).await?;
        info!(event = "signed_in", username = %username, "Signed in");
        Ok(session)
    }

    /// Revoke the session remotely and clear it locally.
    ///
    /// The local session is cleared even when the service cannot be reached.
    pub async fn revoke(&self) -> Result<(), SessionError> {
        let Some(session) = self.store.get().await else {
            return Ok(());
        };

        let remote = self
            .client
            .delete(self.url("revoke")?)
            .bearer_auth(&session.access_token)
            .send()
            .await;

        match remote {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "Service refused revoke, clearing locally")
            }
            Err(e) => warn!(error = %e, "Revoke request failed, clearing locally"),
        }

        self.store.clear().await?;
        info!(event = "signed_out", "Signed out");
        Ok(())
    }
}

fn rejection(status: StatusCode, detail: String) -> SessionError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        SessionError::Rejected(detail)
    } else {
        SessionError::Request(format!("status {}: {}", status, detail))
    }
}

#[async_trait]
impl TokenRefresher for AuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<Session, SessionError> {
        let response = self
            .client
            .post(self.url("refresh")?)
            .json(&json!({ "refresh": refresh_token }))
            .send()
            .await
            .map_err(|e| SessionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(rejection(status, detail));
        }

        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| SessionError::Request(format!("malformed refresh response: {}", e)))?;
        Ok(tokens.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::MemorySessionStore;
    use mockito::{Matcher, Server};

    fn auth_client(server_url: &str, store: Arc<dyn SessionStore>) -> AuthClient {
        let base = Url::parse(&format!("{}/", server_url)).unwrap();
        AuthClient::new(Client::new(), base, store)
    }

    #[tokio::test]
    async fn test_login_stores_session() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/login")
            .match_body(Matcher::Json(json!({
                "username": "ada",
                "password": "pw",
                "pushToken": "push-1"
            })))
            .with_status(201)
            .with_body(r#"{"token": "t1", "refresh": "r1", "expiry": "2030-01-01T00:00:00"}"#)
            .create_async()
            .await;

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let client = auth_client(&server.url(), store.clone());
        let session = client.login("ada", "pw", Some("push-1")).await.unwrap();

        assert_eq!(session.access_token, "t1");
        assert_eq!(store.get().await.unwrap().refresh_token, "r1");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_wrong_password_is_rejected() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/login")
            .with_status(403)
            .with_body(r#"{"detail": "invalid password"}"#)
            .create_async()
            .await;

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let client = auth_client(&server.url(), store.clone());
        let err = client.login("ada", "bad", None).await.unwrap_err();

        assert!(matches!(err, SessionError::Rejected(_)));
        assert!(store.get().await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_request_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/refresh")
            .with_status(502)
            .create_async()
            .await;

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let client = auth_client(&server.url(), store);
        let err = client.refresh("r1").await.unwrap_err();
        assert!(matches!(err, SessionError::Request(_)));
    }

    #[tokio::test]
    async fn test_revoke_clears_even_when_service_refuses() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("DELETE", "/revoke")
            .match_header("authorization", "Bearer t1")
            .with_status(403)
            .with_body(r#"{"detail": "invalid token"}"#)
            .create_async()
            .await;

        let store: Arc<dyn SessionStore> =
            Arc::new(MemorySessionStore::with_session(Session::new("t1", "r1")));
        let client = auth_client(&server.url(), store.clone());
        client.revoke().await.unwrap();

        assert!(store.get().await.is_none());
        mock.assert_async().await;
    }
}
