//! Session authentication
//!
//! Persists the access/refresh token pair, refreshes it ahead of expiry and
//! tells the rest of the client when the session changes.

pub mod events;
pub mod manager;
pub mod store;
pub mod tokens;
pub mod transport;

pub use events::{AuthEvent, EventReceiver};
pub use manager::{AccessTokenOptions, TokenManager};
pub use store::{FileStorage, StorageError, TokenStore};
pub use tokens::{Credential, ExpiresIn, TokenGrant};
pub use transport::{HttpRefreshTransport, RefreshError, RefreshTransport};
