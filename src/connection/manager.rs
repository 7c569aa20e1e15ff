use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use backoff::backoff::Backoff as _;
use futures::future::{BoxFuture, Shared};
use futures::stream::{SplitSink, SplitStream};
use futures::{FutureExt as _, SinkExt as _, StreamExt as _};
use secrecy::{ExposeSecret as _, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

use super::config::ConnectionOptions;
use super::error::{ConnectFailed, ConnectionError};
use crate::Result;
use crate::error::Error;
use crate::types::request::OutboundMessage;
use crate::types::response::{InboundMessage, ParsedFrame, parse_frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ConnectOutcome = std::result::Result<(), ConnectFailed>;
type SharedConnect = Shared<BoxFuture<'static, ConnectOutcome>>;

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
    /// Waiting out the backoff after a failed reconnection attempt
    Reconnecting {
        /// Current reconnection attempt number
        attempt: u32,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// The single recipient of recognized inbound messages.
///
/// Messages are delivered in arrival order; the reader task awaits each
/// delivery before parsing the next frame.
#[async_trait]
pub trait MessageListener: Send + Sync + 'static {
    async fn on_message(&self, message: InboundMessage);
}

/// Awaited after a reconnection, before inbound dispatch resumes; the
/// place to re-establish server-side subscriptions.
pub type ReconnectHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Receives frames that parsed as JSON but carry an unrecognized `type`.
pub type InvalidMessageHook = Arc<dyn Fn(Value) + Send + Sync>;

/// Observes every transport closure, normal or not.
pub type CloseHook = Arc<dyn Fn(CloseEvent) + Send + Sync>;

/// A transport close, as seen by the close-code policy.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct CloseEvent {
    pub code: u16,
    pub reason: String,
}

impl CloseEvent {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Closed without a status code.
    pub const NO_STATUS: u16 = 1005;
    const ABNORMAL: u16 = 1006;

    /// Whether this closure should trigger automatic reconnection.
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        self.code != Self::NORMAL && self.code != Self::NO_STATUS
    }

    fn from_frame(frame: Option<CloseFrame>) -> Self {
        match frame {
            Some(frame) => Self {
                code: u16::from(frame.code),
                reason: frame.reason.to_string(),
            },
            None => Self {
                code: Self::NO_STATUS,
                reason: String::new(),
            },
        }
    }

    fn abnormal() -> Self {
        Self {
            code: Self::ABNORMAL,
            reason: String::new(),
        }
    }
}

/// Owns the transport: connect/disconnect lifecycle, implicit
/// reconnect-before-send, keep-alive, inbound validation and dispatch, and
/// automatic reconnection with backoff after abnormal closures.
///
/// At most one connection attempt is ever in flight; concurrent `connect`
/// calls (and sends racing a reconnect) share its outcome.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    endpoint: Url,
    options: ConnectionOptions,
    /// Composed into the URL of the next connection attempt only
    api_token: RwLock<Option<SecretString>>,
    listener: RwLock<Option<Arc<dyn MessageListener>>>,
    on_reconnect: RwLock<Option<ReconnectHook>>,
    on_invalid_message: RwLock<Option<InvalidMessageHook>>,
    on_close: RwLock<Option<CloseHook>>,
    state_tx: watch::Sender<ConnectionState>,
    /// Single-flight slot for the current connection attempt, tagged so a
    /// stale attempt cannot clear a successor's entry
    connect_flight: Mutex<Option<(u64, SharedConnect)>>,
    flight_seq: AtomicU64,
    /// Writer channel of the live connection, if any
    outbound_tx: RwLock<Option<mpsc::UnboundedSender<Message>>>,
    tasks: Mutex<ConnectionTasks>,
    /// Bumped for every established connection; stale teardown compares
    /// against it and backs off
    epoch: AtomicU64,
}

#[derive(Default)]
struct ConnectionTasks {
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    /// Create a manager for `endpoint`. Nothing is opened until
    /// [`connect`](Self::connect) (or an implicit reconnect-before-send).
    pub fn new(endpoint: &str, options: ConnectionOptions) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(ConnectionError::InvalidUrl)?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                options,
                api_token: RwLock::new(None),
                listener: RwLock::new(None),
                on_reconnect: RwLock::new(None),
                on_invalid_message: RwLock::new(None),
                on_close: RwLock::new(None),
                state_tx,
                connect_flight: Mutex::new(None),
                flight_seq: AtomicU64::new(0),
                outbound_tx: RwLock::new(None),
                tasks: Mutex::new(ConnectionTasks::default()),
                epoch: AtomicU64::new(0),
            }),
        })
    }

    /// Open the transport and install `listener` as the recipient of
    /// inbound messages.
    ///
    /// Idempotent: when an attempt is already in flight the call awaits
    /// that same attempt instead of starting a second one, and a call on an
    /// already-open connection resolves immediately.
    pub async fn connect(&self, listener: Arc<dyn MessageListener>) -> Result<()> {
        tracing::debug!(endpoint = %self.inner.endpoint, "connecting to remote endpoint");
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);

        self.ensure_connected(false).await.map_err(Error::from)
    }

    /// Tear the connection down: clears the listener, cancels keep-alive
    /// and pending reconnection, closes the transport. Idempotent.
    pub fn disconnect(&self) {
        tracing::debug!("disconnecting from remote endpoint");
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;

        // Invalidate teardown callbacks from the connection being dropped.
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner
            .connect_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        // The writer forwards the close frame, then exits as the channel
        // drops.
        let outbound = self
            .inner
            .outbound_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = outbound {
            drop(tx.send(Message::Close(None)));
        }

        {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            for handle in [
                tasks.reader.take(),
                tasks.heartbeat.take(),
                tasks.reconnect.take(),
            ]
            .into_iter()
            .flatten()
            {
                handle.abort();
            }
            tasks.writer.take();
        }

        self.inner
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    /// Serialize `message` and write it to the transport.
    ///
    /// A disconnected manager first awaits the attempt already in flight,
    /// or makes exactly one reconnect attempt; `false` is returned (never
    /// an error) when the transport stays unavailable so callers can apply
    /// their own retry policy.
    pub async fn send(&self, message: &OutboundMessage) -> bool {
        if !self.state().is_connected() {
            let in_flight = self
                .inner
                .connect_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some();
            if !in_flight && !self.inner.options.auto_reconnect {
                tracing::debug!("not connected and auto-reconnect is disabled, dropping send");
                return false;
            }

            tracing::debug!("not connected, reconnecting before send");
            if self.ensure_connected(true).await.is_err() {
                tracing::debug!("reconnect before send failed, dropping message");
                return false;
            }
        }

        self.inner.try_send(message)
    }

    /// Update the token composed into the URL of the *next* connection
    /// attempt. An already-open transport is unaffected.
    pub fn set_api_token(&self, token: SecretString) {
        tracing::debug!("API token updated");
        *self
            .inner
            .api_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(token);
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Install the hook awaited after every reconnection, before inbound
    /// dispatch resumes.
    pub fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self
            .inner
            .on_reconnect
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Install the side channel for frames with unrecognized types.
    pub fn set_invalid_message_hook(&self, hook: InvalidMessageHook) {
        *self
            .inner
            .on_invalid_message
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Install an observer for transport closures.
    pub fn set_close_hook(&self, hook: CloseHook) {
        *self
            .inner
            .on_close
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    /// Single-flight connection attempt shared by `connect`, implicit
    /// reconnect-before-send, and the background reconnection loop.
    async fn ensure_connected(&self, reconnecting: bool) -> ConnectOutcome {
        if self.state().is_connected() {
            return Ok(());
        }

        let future = {
            let mut slot = self
                .inner
                .connect_flight
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if let Some((_, inflight)) = slot.as_ref() {
                tracing::debug!("connection attempt already in flight, awaiting it");
                inflight.clone()
            } else {
                let flight_id = self.inner.flight_seq.fetch_add(1, Ordering::Relaxed) + 1;
                let inner = Arc::clone(&self.inner);
                let future = async move {
                    inner.state_tx.send_replace(ConnectionState::Connecting);
                    let result = ConnectionInner::open_transport(&inner).await;

                    // Clear the slot before the reconnect hook runs: a send
                    // inside the hook that finds the transport dead again
                    // must be able to start a fresh attempt. Only this
                    // attempt's own entry is cleared.
                    {
                        let mut slot = inner
                            .connect_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner);
                        if matches!(slot.as_ref(), Some((id, _)) if *id == flight_id) {
                            *slot = None;
                        }
                    }

                    match result {
                        Ok(dispatch_gate) => {
                            if reconnecting {
                                let hook = inner
                                    .on_reconnect
                                    .read()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .clone();
                                if let Some(hook) = hook {
                                    tracing::debug!(
                                        "re-establishing subscriptions before resuming dispatch"
                                    );
                                    hook().await;
                                }
                            }

                            // Inbound dispatch starts only once this fires.
                            drop(dispatch_gate.send(()));
                            Ok(())
                        }
                        Err(error) => {
                            inner.state_tx.send_replace(ConnectionState::Disconnected);
                            Err(ConnectFailed(Arc::new(error)))
                        }
                    }
                }
                .boxed()
                .shared();

                *slot = Some((flight_id, future.clone()));
                future
            }
        };

        future.await
    }

    /// Background reconnection: wait out the configured delay, then keep
    /// attempting under the exponential backoff until connected or the
    /// attempt budget runs out. Failures are logged, not surfaced; no
    /// caller is waiting.
    async fn reconnect_loop(&self) {
        sleep(self.inner.options.reconnect_delay).await;

        let mut backoff = self.inner.options.reconnect_backoff();
        let mut attempt = 1_u32;

        loop {
            match self.ensure_connected(true).await {
                Ok(()) => {
                    tracing::info!("reconnected to remote endpoint");
                    return;
                }
                Err(error) => {
                    if let Some(max) = self.inner.options.reconnect.max_attempts
                        && attempt >= max
                    {
                        tracing::warn!(%error, attempt, "reconnection attempts exhausted, giving up");
                        return;
                    }

                    let Some(delay) = backoff.next_backoff() else {
                        tracing::warn!(%error, attempt, "reconnection backoff exhausted, giving up");
                        return;
                    };

                    self.inner
                        .state_tx
                        .send_replace(ConnectionState::Reconnecting { attempt });
                    tracing::debug!(%error, attempt, ?delay, "reconnection attempt failed, backing off");
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl ConnectionInner {
    /// Open the transport and stand up the per-connection tasks. Returns
    /// the gate that releases inbound dispatch; the caller fires it once
    /// any post-open work (resubscription after a reconnect) is done.
    async fn open_transport(inner: &Arc<Self>) -> Result<oneshot::Sender<()>> {
        let url = inner.compose_url();
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(ConnectionError::Transport)?;
        let (write, read) = ws_stream.split();

        let generation = inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        *inner
            .outbound_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(outbound_tx);

        let writer = tokio::spawn(writer_loop(write, outbound_rx));
        let (gate_tx, gate_rx) = oneshot::channel();
        let reader = tokio::spawn(reader_loop(Arc::clone(inner), read, generation, gate_rx));
        let heartbeat = inner
            .options
            .keep_alive
            .then(|| tokio::spawn(heartbeat_loop(Arc::clone(inner))));

        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            replace_task(&mut tasks.reader, Some(reader));
            replace_task(&mut tasks.writer, Some(writer));
            replace_task(&mut tasks.heartbeat, heartbeat);
        }

        inner.state_tx.send_replace(ConnectionState::Connected);
        tracing::debug!(generation, "transport open");

        Ok(gate_tx)
    }

    fn compose_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        let token = self
            .api_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(token) = token {
            url.query_pairs_mut()
                .append_pair("token", token.expose_secret());
        }

        url
    }

    fn try_send(&self, message: &OutboundMessage) -> bool {
        let Ok(json) = serde_json::to_string(message) else {
            tracing::debug!("failed to serialize outbound message, dropping it");
            return false;
        };

        let guard = self
            .outbound_tx
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) => tx.send(Message::Text(json.into())).is_ok(),
            None => false,
        }
    }

    async fn handle_frame(&self, text: &str) {
        match parse_frame(text) {
            None => tracing::debug!("dropping non-JSON frame from peer"),
            Some(ParsedFrame::Unrecognized(value)) => {
                tracing::debug!("routing frame with unrecognized type to invalid-message hook");
                let hook = self
                    .on_invalid_message
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(hook) = hook {
                    hook(value);
                }
            }
            Some(ParsedFrame::Message(message)) => {
                let listener = self
                    .listener
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                if let Some(listener) = listener {
                    listener.on_message(message).await;
                }
            }
        }
    }

    /// Teardown driven by the reader task observing the transport close.
    fn handle_close(self: &Arc<Self>, generation: u64, event: CloseEvent) {
        // A newer connection owns the state now; stale teardown is a no-op.
        if self.epoch.load(Ordering::SeqCst) != generation {
            return;
        }

        tracing::debug!(code = event.code, reason = %event.reason, "transport closed");
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.outbound_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(heartbeat) = tasks.heartbeat.take() {
                heartbeat.abort();
            }
        }

        let hook = self
            .on_close
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(hook) = hook {
            hook(event.clone());
        }

        if event.is_abnormal() && self.options.auto_reconnect {
            tracing::debug!(code = event.code, "abnormal closure, scheduling reconnection");
            let manager = ConnectionManager {
                inner: Arc::clone(self),
            };
            let handle = tokio::spawn(async move {
                manager.reconnect_loop().await;
            });

            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            replace_task(&mut tasks.reconnect, Some(handle));
        }
    }
}

fn replace_task(slot: &mut Option<JoinHandle<()>>, new: Option<JoinHandle<()>>) {
    if let Some(old) = slot.take() {
        old.abort();
    }
    *slot = new;
}

async fn writer_loop(
    mut write: SplitSink<WsStream, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let closing = matches!(frame, Message::Close(_));
        if write.send(frame).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }

    _ = write.close().await;
}

async fn reader_loop(
    inner: Arc<ConnectionInner>,
    mut read: SplitStream<WsStream>,
    generation: u64,
    gate: oneshot::Receiver<()>,
) {
    // A dropped gate means the opener is gone; proceed rather than stall.
    _ = gate.await;

    let close = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => inner.handle_frame(text.as_str()).await,
            Some(Ok(Message::Close(frame))) => break CloseEvent::from_frame(frame),
            Some(Ok(_)) => {
                // Binary and control frames are not part of the wire contract.
            }
            Some(Err(error)) => {
                tracing::debug!(%error, "transport failed while reading");
                break CloseEvent::abnormal();
            }
            None => break CloseEvent::abnormal(),
        }
    };

    inner.handle_close(generation, close);
}

/// Keep-alive loop: one `pong` frame per interval while connected.
async fn heartbeat_loop(inner: Arc<ConnectionInner>) {
    let mut ticker = interval(inner.options.keep_alive_interval);
    // The first tick of an interval completes immediately; consume it.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        // Skip silently while the transport is down.
        if !inner.state_tx.borrow().is_connected() {
            continue;
        }

        if inner.try_send(&OutboundMessage::keep_alive()) {
            tracing::trace!("sent keep-alive frame");
        } else {
            tracing::debug!("keep-alive frame dropped, no writable transport");
        }
    }
}
