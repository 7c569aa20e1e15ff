use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::handler::StreamHandler;
use crate::Result;
use crate::connection::{ConnectionManager, MessageListener};
use crate::retry::{QuadraticBackoff, RetryOptions, SendExhausted, retry};
use crate::types::request::OutboundMessage;
use crate::types::response::InboundMessage;

/// Registry of active logical streams and the router between them and the
/// connection.
///
/// Inbound messages carrying a `req_id` are delivered to the stream
/// registered under that id; everything else is broadcast to all streams in
/// registration order. After a reconnection every registered stream is
/// resubscribed, also in registration order.
#[derive(Clone)]
pub struct SubscriptionMultiplexer {
    inner: Arc<MultiplexerInner>,
}

struct MultiplexerInner {
    connection: ConnectionManager,
    registry: DashMap<String, RegisteredStream>,
    registration_seq: AtomicU64,
    retry: RetryOptions,
}

struct RegisteredStream {
    handler: Arc<dyn StreamHandler>,
    /// Registration order, for deterministic resubscription and broadcast
    seq: u64,
}

impl SubscriptionMultiplexer {
    #[must_use]
    pub fn new(connection: ConnectionManager, retry: RetryOptions) -> Self {
        Self {
            inner: Arc::new(MultiplexerInner {
                connection,
                registry: DashMap::new(),
                registration_seq: AtomicU64::new(0),
                retry,
            }),
        }
    }

    /// Register `handler` and send its subscribe request in the background.
    ///
    /// Returns the stream id immediately, without waiting for network
    /// confirmation. Registering over an existing id is a caller error: it
    /// is logged, and the new handler replaces the previous one.
    pub fn subscribe(&self, handler: Arc<dyn StreamHandler>) -> String {
        let id = handler.id().to_owned();
        let seq = self.inner.registration_seq.fetch_add(1, Ordering::Relaxed);

        let previous = self.inner.registry.insert(
            id.clone(),
            RegisteredStream {
                handler: Arc::clone(&handler),
                seq,
            },
        );
        if previous.is_some() {
            tracing::warn!(stream_id = %id, "stream id already registered, replacing previous handler");
        } else {
            tracing::debug!(stream_id = %id, "registered stream");
        }

        let this = self.clone();
        tokio::spawn(async move {
            let message = handler.subscribe_message();
            _ = this.send_message(&message, true).await;
        });

        id
    }

    /// Remove the stream registered under `id` and send its unsubscribe
    /// request in the background. Unknown ids are logged and ignored.
    pub fn unsubscribe(&self, id: &str) {
        let Some((_, entry)) = self.inner.registry.remove(id) else {
            tracing::debug!(stream_id = %id, "unsubscribe for unknown stream id, ignoring");
            return;
        };
        tracing::debug!(stream_id = %id, "unregistered stream");

        let this = self.clone();
        tokio::spawn(async move {
            let message = entry.handler.unsubscribe_message();
            _ = this.send_message(&message, true).await;
        });
    }

    /// Route one inbound message: correlated delivery when its `req_id`
    /// matches a registered stream, broadcast to every stream otherwise.
    pub async fn dispatch(&self, message: InboundMessage) {
        tracing::trace!(message_type = %message.message_type, "dispatching inbound message");

        if let Some(req_id) = message.req_id.as_deref() {
            let target = self
                .inner
                .registry
                .get(req_id)
                .map(|entry| Arc::clone(&entry.handler));

            if let Some(handler) = target {
                handler.on_message(message).await;
                return;
            }

            tracing::debug!(req_id, "no stream registered for correlated message, broadcasting");
        }

        for handler in self.handlers_in_registration_order() {
            handler.on_message(message.clone()).await;
        }
    }

    /// Re-send the subscribe request of every registered stream, in
    /// registration order. Invoked by the connection after an automatic
    /// reconnection, before inbound dispatch resumes.
    pub async fn on_reconnected(&self) {
        let handlers = self.handlers_in_registration_order();
        tracing::debug!(
            count = handlers.len(),
            "re-establishing subscriptions after reconnect"
        );

        for handler in handlers {
            let message = handler.subscribe_message();
            _ = self.send_message(&message, true).await;
        }
    }

    /// Send `message` under the multiplexer's retry budget.
    ///
    /// With `swallow` set, exhaustion is logged and reported as success so
    /// background senders never propagate; otherwise the caller receives a
    /// [`SendExhausted`] error.
    pub async fn send_message(&self, message: &OutboundMessage, swallow: bool) -> Result<()> {
        let backoff = QuadraticBackoff::new(self.inner.retry);
        let connection = &self.inner.connection;

        let outcome = retry(backoff, || async {
            if connection.send(message).await {
                Ok(())
            } else {
                Err(SendRejected)
            }
        })
        .await;

        match outcome {
            Ok(()) => Ok(()),
            Err(SendRejected) => {
                let error = crate::error::Error::from(SendExhausted {
                    attempts: self.inner.retry.max_attempts,
                });
                if swallow {
                    tracing::warn!(%error, "outbound send failed after retries, swallowing");
                    Ok(())
                } else {
                    Err(error)
                }
            }
        }
    }

    /// Number of registered streams.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Whether a stream is registered under `id`.
    #[must_use]
    pub fn is_registered(&self, id: &str) -> bool {
        self.inner.registry.contains_key(id)
    }

    fn handlers_in_registration_order(&self) -> Vec<Arc<dyn StreamHandler>> {
        let mut entries: Vec<(u64, Arc<dyn StreamHandler>)> = self
            .inner
            .registry
            .iter()
            .map(|entry| (entry.value().seq, Arc::clone(&entry.value().handler)))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);

        entries.into_iter().map(|(_, handler)| handler).collect()
    }
}

#[async_trait]
impl MessageListener for SubscriptionMultiplexer {
    async fn on_message(&self, message: InboundMessage) {
        self.dispatch(message).await;
    }
}

/// Per-attempt failure inside the send retry loop.
#[derive(Debug)]
struct SendRejected;

impl fmt::Display for SendRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport rejected send")
    }
}
