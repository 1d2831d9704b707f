//! Token records, grants and expiry normalization

use std::sync::{Arc, RwLock};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::StorageError;

/// Lifetime assumed when a grant carries no usable expiry
pub const DEFAULT_LIFETIME_SECS: u64 = 3600;

pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

fn default_token_type() -> String {
    DEFAULT_TOKEN_TYPE.to_string()
}

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Persisted session credentials. Both tokens are always non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of the access token, epoch milliseconds
    pub expires_at: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

impl TokenRecord {
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_at: i64,
        token_type: Option<String>,
    ) -> Result<Self, StorageError> {
        let record = Self {
            access_token,
            refresh_token,
            expires_at,
            token_type: token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(default_token_type),
        };
        record.validate()?;
        Ok(record)
    }

    pub fn validate(&self) -> Result<(), StorageError> {
        if self.access_token.is_empty() {
            return Err(StorageError::InvalidRecord("access token is empty".into()));
        }
        if self.refresh_token.is_empty() {
            return Err(StorageError::InvalidRecord("refresh token is empty".into()));
        }
        Ok(())
    }

    /// True once `now` is within `buffer_ms` of expiry (or past it).
    pub fn expires_within(&self, now_ms: i64, buffer_ms: i64) -> bool {
        now_ms >= self.expires_at.saturating_sub(buffer_ms)
    }

    /// Apply a refresh result. The refresh token is only replaced when the
    /// backend rotated it.
    pub fn refreshed(&self, grant: TokenGrant, now_ms: i64) -> Self {
        let expires_at = resolve_expiry(grant.expires_in.as_ref(), now_ms);
        Self {
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .filter(|rt| !rt.is_empty())
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at,
            token_type: grant
                .token_type
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.token_type.clone()),
        }
    }
}

/// An access token together with the scheme it is presented under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub token_type: String,
    pub access_token: String,
}

impl Credential {
    /// `Authorization` header value, e.g. `Bearer <token>`
    pub fn header_value(&self) -> String {
        format!("{} {}", self.token_type, self.access_token)
    }
}

impl From<&TokenRecord> for Credential {
    fn from(record: &TokenRecord) -> Self {
        Self {
            token_type: record.token_type.clone(),
            access_token: record.access_token.clone(),
        }
    }
}

/// The credential the HTTP layer currently attaches to requests
#[derive(Debug, Clone, Default)]
pub struct AmbientCredential(Arc<RwLock<Option<Credential>>>);

impl AmbientCredential {
    pub fn get(&self) -> Option<Credential> {
        self.0.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(crate) fn set(&self, credential: Option<Credential>) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = credential;
    }
}

/// `expiresIn` as issued by the backend: either a duration in seconds or an
/// absolute date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresIn {
    Seconds(u64),
    At(String),
}

impl ExpiresIn {
    /// Absolute expiry in epoch milliseconds, or `None` if unparsable.
    pub fn resolve(&self, now_ms: i64) -> Option<i64> {
        match self {
            ExpiresIn::Seconds(secs) => Some(now_ms.saturating_add(secs_to_ms(*secs))),
            ExpiresIn::At(raw) => {
                let raw = raw.trim();
                // Numeric strings are durations
                if let Ok(secs) = raw.parse::<u64>() {
                    return Some(now_ms.saturating_add(secs_to_ms(secs)));
                }
                parse_date_ms(raw)
            }
        }
    }
}

fn secs_to_ms(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1000).saturating_mul(1000)
}

fn parse_date_ms(raw: &str) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    // Dates without an offset are taken as UTC, bare dates at midnight
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc().timestamp_millis())
}

/// Resolve an optional `expiresIn`, falling back to the default lifetime.
pub fn resolve_expiry(expires_in: Option<&ExpiresIn>, now_ms: i64) -> i64 {
    match expires_in.map(|e| (e, e.resolve(now_ms))) {
        Some((_, Some(at))) => at,
        Some((raw, None)) => {
            tracing::warn!(
                "Unrecognized expiresIn {:?}, assuming {}s lifetime",
                raw,
                DEFAULT_LIFETIME_SECS
            );
            now_ms.saturating_add(secs_to_ms(DEFAULT_LIFETIME_SECS))
        }
        None => now_ms.saturating_add(secs_to_ms(DEFAULT_LIFETIME_SECS)),
    }
}

/// Tokens issued by login, registration or refresh.
///
/// `access_token` is empty when the backend answered without one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    #[serde(rename = "accessToken", alias = "access_token", default)]
    pub access_token: String,
    #[serde(
        rename = "refreshToken",
        alias = "refresh_token",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub refresh_token: Option<String>,
    #[serde(
        rename = "expiresIn",
        alias = "expires_in",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_in: Option<ExpiresIn>,
    #[serde(
        rename = "tokenType",
        alias = "token_type",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub token_type: Option<String>,
}

impl TokenGrant {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: Some(refresh_token.into()),
            ..Default::default()
        }
    }

    pub fn expires_in(mut self, expires_in: ExpiresIn) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }
}
