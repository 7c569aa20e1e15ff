use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use bon::Builder;
use chrono::Utc;
use futures::FutureExt as _;
use futures::future::{BoxFuture, Shared};
use secrecy::SecretString;

use super::scheduler::RefreshScheduler;
use super::store::CredentialStore;
use super::{Credential, CredentialSource};
use crate::Result;
use crate::error::{Error, Kind};

const DEFAULT_DELAY_BUFFER_FRACTION: f64 = 0.95;

/// Invoked with the fresh token every time a refresh completes, so the
/// connection layer can pick it up for its next URL composition.
pub type RefreshListener = Arc<dyn Fn(SecretString) + Send + Sync>;

type FetchOutcome = std::result::Result<Credential, FetchFailed>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Tuning for the credential lifecycle.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Builder)]
pub struct CredentialOptions {
    /// Fraction of the remaining lifetime after which renewal fires
    #[builder(default = DEFAULT_DELAY_BUFFER_FRACTION)]
    pub delay_buffer_fraction: f64,
}

impl Default for CredentialOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Owns credential freshness: fetches from the upstream source, caches
/// through the store, proactively schedules renewal before expiry, and
/// single-flights concurrent fetch triggers.
#[derive(Clone)]
pub struct CredentialManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    source: Arc<dyn CredentialSource>,
    store: Arc<dyn CredentialStore>,
    scheduler: RefreshScheduler,
    options: CredentialOptions,
    on_refresh: RwLock<Option<RefreshListener>>,
    fetch_flight: Mutex<Option<SharedFetch>>,
}

impl CredentialManager {
    #[must_use]
    pub fn new(
        source: Arc<dyn CredentialSource>,
        store: Arc<dyn CredentialStore>,
        options: CredentialOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                source,
                store,
                scheduler: RefreshScheduler::new(),
                options,
                on_refresh: RwLock::new(None),
                fetch_flight: Mutex::new(None),
            }),
        }
    }

    /// Register the listener notified with the token of every refresh.
    pub fn set_refresh_listener(&self, listener: RefreshListener) {
        *self
            .inner
            .on_refresh
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Return a usable credential.
    ///
    /// A stored credential that has not reached its expiry is returned
    /// as-is, arming a renewal timer if none is pending. Otherwise a fresh
    /// one is fetched synchronously.
    pub async fn get_credential(&self) -> Result<Credential> {
        let stored = self.inner.store.get().await?;
        if let Some(credential) = stored
            && !credential.is_expired_or_near_expiration()
        {
            self.schedule_next_refresh(&credential, false);

            tracing::debug!("returning stored credential, still valid");
            return Ok(credential);
        }

        tracing::debug!("no usable stored credential, refreshing");
        self.refresh_credential().await
    }

    /// Unconditionally fetch a fresh credential.
    ///
    /// On success the next renewal is armed (replacing any pending timer),
    /// the credential is persisted to the store (persistence failure is
    /// logged, not propagated), and the refresh listener is notified.
    pub async fn refresh_credential(&self) -> Result<Credential> {
        let credential = self.fetch_shared().await?;
        tracing::debug!(expires_at = %credential.expires_at, "fetched fresh credential");

        self.schedule_next_refresh(&credential, true);

        if let Err(error) = self.inner.store.set(&credential).await {
            tracing::warn!(%error, "failed to persist credential to store");
        }

        let listener = self
            .inner
            .on_refresh
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(listener) = listener {
            listener(credential.token.clone());
        }

        Ok(credential)
    }

    /// Whether a renewal timer is currently armed.
    #[must_use]
    pub fn has_scheduled_refresh(&self) -> bool {
        self.inner.scheduler.has_scheduled_job()
    }

    /// Disarm the pending renewal, if any.
    pub fn cancel_scheduled_refresh(&self) {
        self.inner.scheduler.cancel();
    }

    /// Share one upstream fetch among every concurrent trigger. All waiters
    /// observe the same outcome, success or failure.
    async fn fetch_shared(&self) -> FetchOutcome {
        let future = {
            let mut slot = self
                .inner
                .fetch_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some(inflight) = slot.as_ref() {
                tracing::debug!("credential fetch already in flight, awaiting it");
                inflight.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let future = async move {
                    let result = inner
                        .source
                        .fetch()
                        .await
                        .map_err(|error| FetchFailed(Arc::new(error)));

                    // Clear the slot so the next trigger starts a fresh fetch.
                    *inner
                        .fetch_flight
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = None;

                    result
                }
                .boxed()
                .shared();

                *slot = Some(future.clone());
                future
            }
        };

        future.await
    }

    fn schedule_next_refresh(&self, credential: &Credential, force: bool) {
        if !force && self.inner.scheduler.has_scheduled_job() {
            return;
        }

        let delay = self.refresh_delay(credential);
        tracing::debug!(?delay, "scheduling next credential refresh");

        let manager = self.clone();
        self.inner.scheduler.schedule(delay, async move {
            if let Err(error) = manager.refresh_credential().await {
                tracing::warn!(%error, "scheduled credential refresh failed");
            }
        });
    }

    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::float_arithmetic,
        reason = "renewal timing tolerates millisecond-scale rounding"
    )]
    fn refresh_delay(&self, credential: &Credential) -> Duration {
        let remaining_ms = (credential.expires_at - Utc::now()).num_milliseconds().max(0);

        Duration::from_millis(
            (remaining_ms as f64 * self.inner.options.delay_buffer_fraction) as u64,
        )
    }
}

/// Failure of the single in-flight upstream fetch, cloned to every waiter.
#[derive(Clone, Debug)]
pub struct FetchFailed(Arc<Error>);

impl fmt::Display for FetchFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "credential fetch failed: {}", self.0)
    }
}

impl StdError for FetchFailed {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<FetchFailed> for Error {
    fn from(e: FetchFailed) -> Self {
        Error::with_source(Kind::Credential, e)
    }
}
