//! Authenticated HTTP client for the booking API
//!
//! Wraps reqwest::Client with token injection and 401 recovery: a rejected
//! request is retried once after a refresh, never more.

use std::sync::atomic::{AtomicU32, Ordering};

use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode};
use url::Url;

use crate::auth::{AccessTokenOptions, Credential, StorageError, TokenManager};

/// Consecutive unrecovered 401s before the client gives up on the session
pub const MAX_INTERCEPTOR_FAILURES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("401 Unauthorized for {url}")]
    Unauthorized { url: String },

    #[error("HTTP {status} for {url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    manager: TokenManager,
    consecutive_failures: AtomicU32,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, base_url: Url, manager: TokenManager) -> Self {
        Self {
            http,
            base_url,
            manager,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn url(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    pub async fn get(&self, path: &str) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path)?;
        tracing::debug!("GET {}", url);
        let request = self.http.request(Method::GET, url).build()?;
        self.execute(request).await
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ApiError> {
        let url = self.url(path)?;
        tracing::debug!("POST {}", url);
        let request = self.http.request(Method::POST, url).json(body).build()?;
        self.execute(request).await
    }

    /// Send with the current credential, recovering from one 401.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, ApiError> {
        let url = request.url().to_string();
        let sent = self
            .manager
            .request_credential(AccessTokenOptions::default())
            .await;
        let replay = request.try_clone();

        let resp = self.send(request, sent.as_ref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            return check_response(resp, &url).await;
        }

        // Nothing to recover without a credential or a replayable body
        let (Some(sent), Some(replay)) = (sent, replay) else {
            return Err(ApiError::Unauthorized { url });
        };

        if self.consecutive_failures.load(Ordering::SeqCst) >= MAX_INTERCEPTOR_FAILURES {
            tracing::warn!("Repeated 401 responses, clearing session");
            self.consecutive_failures.store(0, Ordering::SeqCst);
            self.manager.clear_tokens().await?;
            return Err(ApiError::Unauthorized { url });
        }

        // Another request may already have refreshed past the token we sent
        let fresh = match self.manager.credential().get() {
            Some(current) if current.access_token != sent.access_token => Some(current),
            _ => self.manager.refresh_credential().await,
        };
        let Some(fresh) = fresh else {
            tracing::info!("401 for {} and no fresh token, not retrying", url);
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            return Err(ApiError::Unauthorized { url });
        };

        tracing::debug!("Retrying {} with refreshed token", url);
        let resp = self.send(replay, Some(&fresh)).await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
            return Err(ApiError::Unauthorized { url });
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        check_response(resp, &url).await
    }

    async fn send(
        &self,
        request: reqwest::Request,
        credential: Option<&Credential>,
    ) -> Result<reqwest::Response, ApiError> {
        let mut builder = reqwest::RequestBuilder::from_parts(self.http.clone(), request);
        if let Some(credential) = credential {
            // Scheme follows the issued token type, not always Bearer
            builder = builder.header(AUTHORIZATION, credential.header_value());
        }
        Ok(builder.send().await?)
    }
}

/// Map non-success statuses to errors, keeping the body for context.
async fn check_response(resp: reqwest::Response, url: &str) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized {
            url: url.to_string(),
        });
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(ApiError::Status {
            status: status.as_u16(),
            url: url.to_string(),
            body,
        });
    }
    Ok(resp)
}
