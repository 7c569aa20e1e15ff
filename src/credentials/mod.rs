//! Credential lifecycle: fetch, cache, and proactive background renewal.
//!
//! The server authenticates connections with a short-lived token passed as a
//! URL query parameter. [`CredentialManager`] keeps one fresh: it fetches
//! from a caller-supplied [`CredentialSource`], caches through a
//! [`CredentialStore`], schedules a renewal before expiry, and single-flights
//! concurrent fetch triggers so the upstream sees at most one request at a
//! time.

pub mod manager;
pub mod scheduler;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
pub use manager::{CredentialManager, CredentialOptions, FetchFailed, RefreshListener};
pub use scheduler::RefreshScheduler;
/// Secret string type that redacts values in debug output.
pub use secrecy::{ExposeSecret, SecretString};
pub use store::{CredentialStore, InMemoryCredentialStore};

use crate::Result;

/// A short-lived authentication token and its expiry instant.
///
/// The token is held as a [`SecretString`] so it never leaks through
/// `Debug` formatting or logs.
#[non_exhaustive]
#[derive(Clone, Debug, serde::Deserialize)]
pub struct Credential {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    #[must_use]
    pub fn new<S: Into<String>>(token: S, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: SecretString::from(token.into()),
            expires_at,
        }
    }

    /// Whether the credential should no longer be handed out.
    #[must_use]
    pub fn is_expired_or_near_expiration(&self) -> bool {
        self.expires_at <= Utc::now()
    }
}

/// Upstream source of fresh credentials, opaque beyond this contract.
#[async_trait]
pub trait CredentialSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Credential>;
}
