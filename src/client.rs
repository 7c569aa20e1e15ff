use std::sync::Arc;

use futures::FutureExt as _;

use crate::Result;
use crate::connection::{ConnectionManager, ConnectionOptions, ConnectionState, MessageListener};
use crate::credentials::manager::CredentialOptions;
use crate::credentials::store::{CredentialStore, InMemoryCredentialStore};
use crate::credentials::{CredentialManager, CredentialSource};
use crate::retry::RetryOptions;
use crate::stream::{StreamHandler, SubscriptionMultiplexer};

/// One logical streaming session: the connection, the credential lifecycle,
/// and the stream registry, wired together.
///
/// - fresh credentials flow into the URL of the next connection attempt;
/// - the multiplexer receives every recognized inbound message;
/// - after an automatic reconnection, every registered stream is
///   resubscribed before new inbound dispatch.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use eventstream_client::Session;
/// use eventstream_client::credentials::{Credential, CredentialSource};
/// use eventstream_client::stream::ChannelStreamHandler;
/// use futures::StreamExt as _;
/// use serde_json::json;
///
/// struct TokenEndpoint;
///
/// #[async_trait::async_trait]
/// impl CredentialSource for TokenEndpoint {
///     async fn fetch(&self) -> eventstream_client::Result<Credential> {
///         // Call your auth endpoint here.
///         Ok(Credential::new("token", chrono::Utc::now() + chrono::Duration::hours(1)))
///     }
/// }
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let session = Session::builder("wss://stream.example.com/v1", Arc::new(TokenEndpoint))
///         .build()?;
///     session.connect().await?;
///
///     let (handler, stream) = ChannelStreamHandler::new("trades", json!({"market": "*"}));
///     session.subscribe(handler);
///
///     futures::pin_mut!(stream);
///     while let Some(message) = stream.next().await {
///         println!("{message:?}");
///     }
///
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    connection: ConnectionManager,
    credentials: CredentialManager,
    streams: SubscriptionMultiplexer,
}

impl Session {
    /// Start building a session against `endpoint`, fetching credentials
    /// from `source`.
    #[must_use]
    pub fn builder<S: Into<String>>(endpoint: S, source: Arc<dyn CredentialSource>) -> SessionBuilder {
        SessionBuilder {
            endpoint: endpoint.into(),
            source,
            store: None,
            connection_options: ConnectionOptions::default(),
            retry_options: RetryOptions::default(),
            credential_options: CredentialOptions::default(),
        }
    }

    /// Fetch a usable credential, then open the connection with the
    /// multiplexer installed as the message listener.
    pub async fn connect(&self) -> Result<()> {
        let credential = self.inner.credentials.get_credential().await?;
        self.inner.connection.set_api_token(credential.token.clone());

        let listener: Arc<dyn MessageListener> = Arc::new(self.inner.streams.clone());
        self.inner.connection.connect(listener).await
    }

    /// Tear the session down: cancels the pending credential renewal and
    /// closes the connection. Idempotent.
    pub fn disconnect(&self) {
        self.inner.credentials.cancel_scheduled_refresh();
        self.inner.connection.disconnect();
    }

    /// Register a logical stream. See
    /// [`SubscriptionMultiplexer::subscribe`].
    pub fn subscribe(&self, handler: Arc<dyn StreamHandler>) -> String {
        self.inner.streams.subscribe(handler)
    }

    /// Remove a logical stream. See
    /// [`SubscriptionMultiplexer::unsubscribe`].
    pub fn unsubscribe(&self, id: &str) {
        self.inner.streams.unsubscribe(id);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// The connection manager backing this session.
    #[must_use]
    pub fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    /// The credential manager backing this session.
    #[must_use]
    pub fn credentials(&self) -> &CredentialManager {
        &self.inner.credentials
    }

    /// The stream multiplexer backing this session.
    #[must_use]
    pub fn streams(&self) -> &SubscriptionMultiplexer {
        &self.inner.streams
    }
}

/// Builder for [`Session`]. Hand-rolled because the seams are trait
/// objects.
pub struct SessionBuilder {
    endpoint: String,
    source: Arc<dyn CredentialSource>,
    store: Option<Arc<dyn CredentialStore>>,
    connection_options: ConnectionOptions,
    retry_options: RetryOptions,
    credential_options: CredentialOptions,
}

impl SessionBuilder {
    /// Use a custom credential store instead of the in-memory default.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the connection behavior.
    #[must_use]
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.connection_options = options;
        self
    }

    /// Override the retry budget for subscription sends.
    #[must_use]
    pub fn retry_options(mut self, options: RetryOptions) -> Self {
        self.retry_options = options;
        self
    }

    /// Override the credential lifecycle tuning.
    #[must_use]
    pub fn credential_options(mut self, options: CredentialOptions) -> Self {
        self.credential_options = options;
        self
    }

    /// Wire the subsystems together.
    pub fn build(self) -> Result<Session> {
        let connection = ConnectionManager::new(&self.endpoint, self.connection_options)?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryCredentialStore::new()));
        let credentials = CredentialManager::new(self.source, store, self.credential_options);
        let streams = SubscriptionMultiplexer::new(connection.clone(), self.retry_options);

        // Fresh tokens reach the next connection attempt's URL.
        let token_sink = connection.clone();
        credentials.set_refresh_listener(Arc::new(move |token| token_sink.set_api_token(token)));

        // Reconnections re-establish every registered stream before new
        // inbound dispatch resumes.
        let resubscriber = streams.clone();
        connection.set_reconnect_hook(Arc::new(move || {
            let streams = resubscriber.clone();
            async move { streams.on_reconnected().await }.boxed()
        }));

        Ok(Session {
            inner: Arc::new(SessionInner {
                connection,
                credentials,
                streams,
            }),
        })
    }
}
