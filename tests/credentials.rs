#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use eventstream_client::Result;
use eventstream_client::credentials::{
    Credential, CredentialManager, CredentialOptions, CredentialSource, CredentialStore,
    ExposeSecret as _, InMemoryCredentialStore,
};
use eventstream_client::error::{Error, Kind};
use tokio::time::sleep;

/// Counts upstream fetches; optionally fails or delays them.
struct CountingSource {
    calls: AtomicUsize,
    lifetime: ChronoDuration,
    delay: Duration,
    fail: bool,
}

impl CountingSource {
    fn new(lifetime: ChronoDuration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            lifetime,
            delay: Duration::from_millis(50),
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            lifetime: ChronoDuration::hours(1),
            delay: Duration::from_millis(50),
            fail: true,
        })
    }

    fn count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for CountingSource {
    async fn fetch(&self) -> Result<Credential> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        sleep(self.delay).await;

        if self.fail {
            return Err(Error::validation("upstream credential service down"));
        }

        Ok(Credential::new(
            format!("tok-{call}"),
            Utc::now() + self.lifetime,
        ))
    }
}

/// A store whose writes always fail.
struct BrokenStore;

#[async_trait]
impl CredentialStore for BrokenStore {
    async fn get(&self) -> Result<Option<Credential>> {
        Ok(None)
    }

    async fn set(&self, _credential: &Credential) -> Result<()> {
        Err(Error::validation("disk full"))
    }
}

fn manager_for(source: Arc<CountingSource>) -> CredentialManager {
    CredentialManager::new(
        source,
        Arc::new(InMemoryCredentialStore::new()),
        CredentialOptions::default(),
    )
}

#[tokio::test]
async fn concurrent_gets_share_one_fetch() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let manager = manager_for(Arc::clone(&source));

    let (a, b, c, d, e) = tokio::join!(
        manager.get_credential(),
        manager.get_credential(),
        manager.get_credential(),
        manager.get_credential(),
        manager.get_credential(),
    );

    let token = a.unwrap().token.expose_secret().to_owned();
    for result in [b, c, d, e] {
        assert_eq!(result.unwrap().token.expose_secret(), token);
    }
    assert_eq!(source.count(), 1, "expected a single upstream fetch");
}

#[tokio::test]
async fn concurrent_fetch_failure_is_shared() {
    let source = CountingSource::failing();
    let manager = manager_for(Arc::clone(&source));

    let (a, b, c) = tokio::join!(
        manager.refresh_credential(),
        manager.refresh_credential(),
        manager.refresh_credential(),
    );

    for result in [a, b, c] {
        let error = result.expect_err("fetch should have failed");
        assert_eq!(error.kind(), Kind::Credential);
    }
    assert_eq!(source.count(), 1, "expected a single upstream fetch");
    assert!(
        !manager.has_scheduled_refresh(),
        "nothing to renew after a failed fetch"
    );
}

#[tokio::test]
async fn stored_credential_is_returned_without_fetching() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let store = Arc::new(InMemoryCredentialStore::new());
    let stored = Credential::new("stored-tok", Utc::now() + ChronoDuration::hours(1));
    store.set(&stored).await.unwrap();

    let manager = CredentialManager::new(
        Arc::clone(&source) as Arc<dyn CredentialSource>,
        store,
        CredentialOptions::default(),
    );

    let credential = manager.get_credential().await.unwrap();

    assert_eq!(credential.token.expose_secret(), "stored-tok");
    assert_eq!(source.count(), 0, "upstream fetch was not needed");
    assert!(
        manager.has_scheduled_refresh(),
        "passive get should arm a renewal"
    );
}

#[tokio::test]
async fn expired_stored_credential_triggers_refresh() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let store = Arc::new(InMemoryCredentialStore::new());
    let stale = Credential::new("stale-tok", Utc::now() - ChronoDuration::seconds(5));
    store.set(&stale).await.unwrap();

    let manager = CredentialManager::new(
        Arc::clone(&source) as Arc<dyn CredentialSource>,
        store,
        CredentialOptions::default(),
    );

    let credential = manager.get_credential().await.unwrap();

    assert_eq!(credential.token.expose_secret(), "tok-1");
    assert_eq!(source.count(), 1);
}

#[tokio::test]
async fn scheduled_renewal_fires_and_rearms() {
    let source = Arc::new(CountingSource {
        calls: AtomicUsize::new(0),
        lifetime: ChronoDuration::milliseconds(400),
        delay: Duration::ZERO,
        fail: false,
    });
    let manager = CredentialManager::new(
        Arc::clone(&source) as Arc<dyn CredentialSource>,
        Arc::new(InMemoryCredentialStore::new()),
        CredentialOptions::builder().delay_buffer_fraction(0.5).build(),
    );

    manager.refresh_credential().await.unwrap();
    assert!(manager.has_scheduled_refresh());

    // Renewal fires at ~200 ms; give it room, then confirm it both fetched
    // and armed its successor without leaving two timers.
    sleep(Duration::from_millis(350)).await;
    assert!(source.count() >= 2, "renewal never fired");
    assert!(manager.has_scheduled_refresh(), "renewal did not re-arm");

    manager.cancel_scheduled_refresh();
    assert!(!manager.has_scheduled_refresh());
}

#[tokio::test]
async fn refresh_notifies_listener_with_new_token() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let manager = manager_for(source);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    manager.set_refresh_listener(Arc::new(move |token| {
        drop(tx.send(token.expose_secret().to_owned()));
    }));

    manager.refresh_credential().await.unwrap();

    let notified = rx.recv().await.unwrap();
    assert_eq!(notified, "tok-1");
}

#[tokio::test]
async fn store_persistence_failure_is_not_propagated() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let manager = CredentialManager::new(
        source,
        Arc::new(BrokenStore),
        CredentialOptions::default(),
    );

    let credential = manager.refresh_credential().await.unwrap();

    assert_eq!(credential.token.expose_secret(), "tok-1");
}

#[tokio::test]
async fn forced_refresh_replaces_the_scheduled_renewal() {
    let source = CountingSource::new(ChronoDuration::hours(1));
    let manager = manager_for(Arc::clone(&source));

    manager.refresh_credential().await.unwrap();
    manager.refresh_credential().await.unwrap();

    assert_eq!(source.count(), 2);
    assert!(manager.has_scheduled_refresh());
}
