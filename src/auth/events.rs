//! Session state-transition events
//!
//! A thin typed wrapper over `tokio::sync::broadcast`. Publishing never
//! blocks and never fails when nobody is listening.

use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Transitions observed by UI-level auth state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    TokenRefreshed { access_token: String },
    TokenExpired { reason: String },
    AuthenticationFailed { error: String },
    TokensCleared,
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::TokenRefreshed { .. } => "TOKEN_REFRESHED",
            AuthEvent::TokenExpired { .. } => "TOKEN_EXPIRED",
            AuthEvent::AuthenticationFailed { .. } => "AUTHENTICATION_FAILED",
            AuthEvent::TokensCleared => "TOKENS_CLEARED",
        }
    }
}

pub type EventReceiver = broadcast::Receiver<AuthEvent>;

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AuthEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: AuthEvent) {
        tracing::debug!("auth event {}", event.name());
        // Err only means there are no subscribers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
