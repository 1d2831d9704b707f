//! HTTP refresh-token exchange against the booking backend

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use url::Url;

use super::tokens::TokenGrant;

/// Why a refresh exchange failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// Network error, timeout or server fault; worth retrying
    #[error("refresh transport failed: {0}")]
    Transient(String),

    /// The backend refused the refresh token
    #[error("refresh token rejected: {0}")]
    Rejected(String),
}

/// Exchanges a refresh token for new tokens.
///
/// Injected into the manager after construction so the HTTP layer can
/// depend on the manager without the manager depending on it.
#[async_trait]
pub trait RefreshTransport: Send + Sync {
    async fn exchange_refresh_token(&self, refresh_token: &str)
        -> Result<TokenGrant, RefreshError>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    #[serde(rename = "refreshToken")]
    refresh_token: &'a str,
}

/// The backend answers either with the grant itself or wrapped in `data`
#[derive(Deserialize)]
#[serde(untagged)]
enum RefreshResponse {
    Wrapped { data: TokenGrant },
    Flat(TokenGrant),
}

impl RefreshResponse {
    fn into_grant(self) -> TokenGrant {
        match self {
            RefreshResponse::Wrapped { data } => data,
            RefreshResponse::Flat(grant) => grant,
        }
    }
}

/// `POST {refresh_url}` with `{"refreshToken": ...}`
pub struct HttpRefreshTransport {
    http: reqwest::Client,
    refresh_url: Url,
}

impl HttpRefreshTransport {
    /// `http` should carry the request timeout; a timeout is retried like
    /// any other transport failure.
    pub fn new(http: reqwest::Client, refresh_url: Url) -> Self {
        Self { http, refresh_url }
    }
}

#[async_trait]
impl RefreshTransport for HttpRefreshTransport {
    async fn exchange_refresh_token(
        &self,
        refresh_token: &str,
    ) -> Result<TokenGrant, RefreshError> {
        tracing::debug!("POST {}", self.refresh_url);

        let resp = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest { refresh_token })
            .send()
            .await
            .map_err(|e| RefreshError::Transient(format!("refresh request failed: {}", e)))?;

        let status = resp.status();
        if matches!(
            status,
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
        ) {
            let body = resp.text().await.unwrap_or_default();
            return Err(RefreshError::Rejected(format!(
                "HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }
        if !status.is_success() {
            return Err(RefreshError::Transient(format!("HTTP {}", status.as_u16())));
        }

        let parsed: RefreshResponse = resp
            .json()
            .await
            .map_err(|e| RefreshError::Transient(format!("unreadable refresh response: {}", e)))?;
        Ok(parsed.into_grant())
    }
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::auth::tokens::ExpiresIn;

    async fn transport_for(server: &MockServer) -> HttpRefreshTransport {
        let url = Url::parse(&format!("{}/auth/refresh", server.uri())).unwrap();
        HttpRefreshTransport::new(reqwest::Client::new(), url)
    }

    #[tokio::test]
    async fn test_flat_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .and(body_json(serde_json::json!({ "refreshToken": "rt" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "accessToken": "at1",
                "refreshToken": "rt1",
                "expiresIn": 900,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let grant = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap();
        assert_eq!(grant.access_token, "at1");
        assert_eq!(grant.refresh_token.as_deref(), Some("rt1"));
        assert_eq!(grant.expires_in, Some(ExpiresIn::Seconds(900)));
    }

    #[tokio::test]
    async fn test_wrapped_response_with_date_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/refresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "access_token": "at1",
                    "expires_in": "2030-01-01T00:00:00Z",
                }
            })))
            .mount(&server)
            .await;

        let grant = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap();
        assert_eq!(grant.access_token, "at1");
        assert_eq!(grant.refresh_token, None);
        assert_eq!(
            grant.expires_in,
            Some(ExpiresIn::At("2030-01-01T00:00:00Z".into()))
        );
    }

    #[tokio::test]
    async fn test_success_without_token_is_passed_through() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "ok": true })),
            )
            .mount(&server)
            .await;

        let grant = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap();
        assert!(!grant.has_access_token());
    }

    #[tokio::test]
    async fn test_auth_statuses_are_rejections() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap_err();
        assert_eq!(err, RefreshError::Rejected("HTTP 401: invalid_grant".into()));
    }

    #[tokio::test]
    async fn test_server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Transient(_)));
    }

    #[tokio::test]
    async fn test_garbage_body_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = transport_for(&server)
            .await
            .exchange_refresh_token("rt")
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::Transient(_)));
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_transient() {
        let server = MockServer::start().await;
        let transport = transport_for(&server).await;
        drop(server);

        let err = transport.exchange_refresh_token("rt").await.unwrap_err();
        assert!(matches!(err, RefreshError::Transient(_)));
    }
}
