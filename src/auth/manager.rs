//! Token lifecycle manager
//!
//! One instance per process, created at startup and handed to the HTTP
//! layer and to anything that needs a credential. It owns the in-memory
//! refresh coordination state:
//!
//! - at most one refresh exchange is in flight; concurrent callers await
//!   the same shared outcome
//! - a cooldown between proactive refresh attempts
//! - a consecutive-failure circuit breaker that ends the session
//! - a generation counter so a refresh that settles after logout or a new
//!   login never writes its stale result back

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};

use super::events::{AuthEvent, EventBus, EventReceiver};
use super::store::{StorageError, TokenStore};
use super::tokens::{
    resolve_expiry, AmbientCredential, Clock, Credential, SystemClock, TokenGrant, TokenRecord,
    DEFAULT_TOKEN_TYPE,
};
use super::transport::{RefreshError, RefreshTransport};

/// Refresh proactively once the access token is this close to expiry
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);
/// Minimum spacing between proactive refresh attempts
pub const REFRESH_COOLDOWN: Duration = Duration::from_secs(5);
/// Consecutive failed exchanges before the session is terminated
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
/// Exchanges per logical refresh (transient failures only)
pub const MAX_REFRESH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// How long past expiry a session still reads as authenticated
pub const AUTH_GRACE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default)]
pub struct AccessTokenOptions {
    /// Return the stored token as-is, never refreshing
    pub skip_refresh: bool,
}

/// Point-in-time view of the session, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub authenticated: bool,
    pub expires_at: Option<i64>,
    pub consecutive_failures: u32,
    pub refreshing: bool,
}

type RefreshFuture = Shared<BoxFuture<'static, Option<String>>>;

#[derive(Default)]
struct RefreshState {
    in_flight: Option<RefreshFuture>,
    last_attempt_at: Option<i64>,
    consecutive_failures: u32,
    generation: u64,
}

impl RefreshState {
    /// Back to zero for a new (or no) session. An in-flight refresh keeps
    /// its slot; the generation bump makes it discard its result.
    fn reset(&mut self) {
        self.last_attempt_at = None;
        self.consecutive_failures = 0;
        self.generation += 1;
    }
}

struct Inner {
    store: TokenStore,
    transport: RwLock<Option<Arc<dyn RefreshTransport>>>,
    events: EventBus,
    credential: AmbientCredential,
    clock: Arc<dyn Clock>,
    state: Mutex<RefreshState>,
    // Serializes record write-back against store/clear
    write_lock: tokio::sync::Mutex<()>,
}

/// Shared handle to the session's token lifecycle
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<Inner>,
}

fn millis(d: Duration) -> i64 {
    d.as_millis() as i64
}

fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1))
}

enum Decision {
    UseStored,
    TripBreaker,
    Refresh,
}

impl TokenManager {
    pub fn new(store: TokenStore) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: TokenStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                transport: RwLock::new(None),
                events: EventBus::new(),
                credential: AmbientCredential::default(),
                clock,
                state: Mutex::new(RefreshState::default()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn RefreshTransport>) {
        *self
            .inner
            .transport
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.inner.events.subscribe()
    }

    pub fn credential(&self) -> AmbientCredential {
        self.inner.credential.clone()
    }

    /// Seed the ambient credential from storage at startup.
    pub async fn hydrate(&self) {
        let record = self.inner.store.load().await;
        self.inner.credential.set(record.as_ref().map(Credential::from));
    }

    /// Current access token, refreshing first when it is close to expiry.
    ///
    /// Never fails: every problem resolves to `None` (logged out) or to the
    /// stored token.
    pub async fn access_token(&self, opts: AccessTokenOptions) -> Option<String> {
        self.request_credential(opts).await.map(|c| c.access_token)
    }

    /// Like [`access_token`](Self::access_token), paired with the token type
    /// the backend issued it under.
    pub async fn request_credential(&self, opts: AccessTokenOptions) -> Option<Credential> {
        let record = self.inner.store.load().await?;
        if opts.skip_refresh {
            return Some(Credential::from(&record));
        }

        let now = self.inner.clock.now_ms();
        if !record.expires_within(now, millis(REFRESH_BUFFER)) {
            return Some(Credential::from(&record));
        }

        let decision = {
            let mut state = self.inner.state();
            let cooling = state
                .last_attempt_at
                .is_some_and(|last| now - last < millis(REFRESH_COOLDOWN));
            if cooling {
                Decision::UseStored
            } else if state.consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                Decision::TripBreaker
            } else {
                state.last_attempt_at = Some(now);
                Decision::Refresh
            }
        };

        match decision {
            Decision::UseStored => {
                tracing::debug!("Refresh cooldown active, using stored access token");
                Some(Credential::from(&record))
            }
            Decision::TripBreaker => {
                tracing::warn!("Refresh circuit breaker open, clearing session");
                if let Err(e) = self.clear_tokens().await {
                    tracing::warn!("Failed to clear tokens: {}", e);
                }
                None
            }
            Decision::Refresh => {
                let token = self.refresh_access_token().await?;
                Some(self.inner.pair(token, &record.token_type))
            }
        }
    }

    /// Exchange the refresh token, returning the new credential.
    pub async fn refresh_credential(&self) -> Option<Credential> {
        let token = self.refresh_access_token().await?;
        Some(self.inner.pair(token, DEFAULT_TOKEN_TYPE))
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Concurrent callers share one exchange. The exchange runs on its own
    /// task so it settles even if every caller goes away.
    pub async fn refresh_access_token(&self) -> Option<String> {
        let refresh = {
            let mut state = self.inner.state();
            if let Some(in_flight) = state.in_flight.clone() {
                tracing::debug!("Joining in-flight token refresh");
                in_flight
            } else {
                let inner = Arc::clone(&self.inner);
                let generation = state.generation;
                let task = tokio::spawn(async move {
                    let _slot = InFlightSlot(Arc::clone(&inner));
                    let outcome = AssertUnwindSafe(inner.run_refresh(generation))
                        .catch_unwind()
                        .await;
                    match outcome {
                        Ok(token) => token,
                        Err(_) => {
                            tracing::error!("Token refresh panicked, ending session");
                            inner.record_failure(generation);
                            let reason = "token refresh task failed".to_string();
                            inner
                                .abandon(generation, AuthEvent::TokenExpired { reason })
                                .await
                        }
                    }
                });
                let shared = async move {
                    task.await.unwrap_or_else(|e| {
                        tracing::warn!("Token refresh task failed: {}", e);
                        None
                    })
                }
                .boxed()
                .shared();
                state.in_flight = Some(shared.clone());
                shared
            }
        };
        refresh.await
    }

    /// Persist tokens from a login, registration or external refresh.
    pub async fn store_tokens(&self, grant: TokenGrant) -> Result<(), StorageError> {
        let expires_at = resolve_expiry(grant.expires_in.as_ref(), self.inner.clock.now_ms());
        let record = TokenRecord::new(
            grant.access_token,
            grant.refresh_token.unwrap_or_default(),
            expires_at,
            grant.token_type,
        )?;

        let _write = self.inner.write_lock.lock().await;
        self.inner.state().reset();
        self.inner.store.save(&record).await?;
        self.inner.credential.set(Some(Credential::from(&record)));
        tracing::info!("Session tokens stored (expires_at={})", expires_at);
        Ok(())
    }

    /// End the session. Safe to call when already logged out.
    pub async fn clear_tokens(&self) -> Result<(), StorageError> {
        let _write = self.inner.write_lock.lock().await;
        self.inner.clear_locked().await
    }

    /// Whether a session exists and is not long expired. Never refreshes.
    pub async fn is_authenticated(&self) -> bool {
        match self.inner.store.load().await {
            Some(record) => {
                self.inner.clock.now_ms() <= record.expires_at.saturating_add(millis(AUTH_GRACE))
            }
            None => false,
        }
    }

    pub async fn status(&self) -> SessionStatus {
        let record = self.inner.store.load().await;
        let authenticated = self.is_authenticated().await;
        let state = self.inner.state();
        SessionStatus {
            authenticated,
            expires_at: record.map(|r| r.expires_at),
            consecutive_failures: state.consecutive_failures,
            refreshing: state.in_flight.is_some(),
        }
    }
}

/// Frees the single in-flight slot when the refresh task ends
struct InFlightSlot(Arc<Inner>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.0.state().in_flight = None;
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transport(&self) -> Option<Arc<dyn RefreshTransport>> {
        self.transport
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn superseded(&self, generation: u64) -> bool {
        self.state().generation != generation
    }

    /// Count a failed exchange against the session it started in.
    fn record_failure(&self, generation: u64) -> u32 {
        let mut state = self.state();
        if state.generation == generation {
            state.consecutive_failures += 1;
        }
        state.consecutive_failures
    }

    async fn current_access_token(&self) -> Option<String> {
        self.store.load().await.map(|r| r.access_token)
    }

    /// Attach the ambient token type to a token a refresh handed back.
    fn pair(&self, access_token: String, fallback_type: &str) -> Credential {
        match self.credential.get() {
            Some(current) if current.access_token == access_token => current,
            _ => Credential {
                token_type: fallback_type.to_string(),
                access_token,
            },
        }
    }

    async fn run_refresh(&self, generation: u64) -> Option<String> {
        self.state().last_attempt_at = Some(self.clock.now_ms());

        let Some(record) = self.store.load().await else {
            tracing::debug!("No stored tokens, nothing to refresh");
            return None;
        };
        let transport = self.transport();

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::debug!("Token refresh attempt {}/{}", attempt, MAX_REFRESH_ATTEMPTS);

            let result = match &transport {
                Some(transport) => transport.exchange_refresh_token(&record.refresh_token).await,
                None => Err(RefreshError::Transient(
                    "no refresh transport configured".into(),
                )),
            };

            if self.superseded(generation) {
                tracing::debug!("Session changed during refresh, discarding result");
                return self.current_access_token().await;
            }

            match result {
                Ok(grant) if grant.has_access_token() => {
                    return self.complete_refresh(generation, &record, grant).await;
                }
                Ok(_) => {
                    tracing::warn!("Refresh response carried no access token");
                    return self
                        .abandon(
                            generation,
                            AuthEvent::AuthenticationFailed {
                                error: "refresh response carried no access token".into(),
                            },
                        )
                        .await;
                }
                Err(RefreshError::Rejected(msg)) => {
                    tracing::warn!("Refresh token rejected: {}", msg);
                    return self
                        .abandon(generation, AuthEvent::AuthenticationFailed { error: msg })
                        .await;
                }
                Err(RefreshError::Transient(msg)) => {
                    let failures = self.record_failure(generation);
                    tracing::warn!(
                        "Token refresh attempt {}/{} failed: {}",
                        attempt,
                        MAX_REFRESH_ATTEMPTS,
                        msg
                    );

                    // Breaker open or attempts used up
                    if failures >= MAX_CONSECUTIVE_FAILURES || attempt >= MAX_REFRESH_ATTEMPTS {
                        let reason = format!("refresh failed {} times: {}", failures, msg);
                        return self
                            .abandon(generation, AuthEvent::TokenExpired { reason })
                            .await;
                    }

                    tokio::time::sleep(backoff_delay(attempt)).await;
                    if self.superseded(generation) {
                        return self.current_access_token().await;
                    }
                }
            }
        }
    }

    async fn complete_refresh(
        &self,
        generation: u64,
        previous: &TokenRecord,
        grant: TokenGrant,
    ) -> Option<String> {
        let updated = previous.refreshed(grant, self.clock.now_ms());

        let _write = self.write_lock.lock().await;
        if self.superseded(generation) {
            tracing::debug!("Session changed during refresh, discarding result");
            return self.current_access_token().await;
        }

        self.state().consecutive_failures = 0;
        if let Err(e) = self.store.save(&updated).await {
            tracing::warn!("Failed to persist refreshed tokens: {}", e);
        }
        self.credential.set(Some(Credential::from(&updated)));
        self.events.publish(AuthEvent::TokenRefreshed {
            access_token: updated.access_token.clone(),
        });
        tracing::info!("Access token refreshed");
        Some(updated.access_token)
    }

    /// Terminal refresh failure: end the session unless it already changed.
    async fn abandon(&self, generation: u64, event: AuthEvent) -> Option<String> {
        let _write = self.write_lock.lock().await;
        if self.superseded(generation) {
            return self.current_access_token().await;
        }

        if let Err(e) = self.clear_locked().await {
            tracing::warn!("Failed to clear tokens after refresh failure: {}", e);
        }
        self.events.publish(event);
        None
    }

    /// Caller holds `write_lock`.
    async fn clear_locked(&self) -> Result<(), StorageError> {
        self.state().reset();
        self.credential.set(None);
        self.store.clear().await?;
        self.events.publish(AuthEvent::TokensCleared);
        tracing::info!("Session tokens cleared");
        Ok(())
    }
}
