use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::Credential;
use crate::Result;

/// Pluggable persistence for the current credential.
///
/// The default [`InMemoryCredentialStore`] keeps it in-process; callers with
/// durable storage (keychain, disk, shared cache) implement this trait and
/// hand it to the manager.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn get(&self) -> Result<Option<Credential>>;
    async fn set(&self, credential: &Credential) -> Result<()>;
}

/// In-process credential store. The default when none is supplied.
#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    slot: RwLock<Option<Credential>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get(&self) -> Result<Option<Credential>> {
        // Option<Credential> has no inconsistent intermediate state, so a
        // poisoned lock is recoverable.
        Ok(self
            .slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn set(&self, credential: &Credential) -> Result<()> {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }
}
