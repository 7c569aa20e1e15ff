use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::types::request::OutboundMessage;
use crate::types::response::InboundMessage;

/// Buffered messages per channel-backed stream before dispatch backpressures.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// A logical stream: an identifier-keyed request for a continuous feed of
/// server-pushed messages, independent of any single transport connection's
/// lifetime.
///
/// The id doubles as the correlation identifier (`req_id`) echoed by the
/// server, so it must be unique among concurrently registered handlers.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    /// Correlation identifier for this stream.
    fn id(&self) -> &str;

    /// The request that opens (and re-opens) this stream server-side.
    fn subscribe_message(&self) -> OutboundMessage;

    /// The request that tears this stream down server-side.
    fn unsubscribe_message(&self) -> OutboundMessage {
        OutboundMessage::unsubscribe(self.id())
    }

    /// Deliver one inbound message belonging to this stream.
    async fn on_message(&self, message: InboundMessage);
}

/// A ready-made [`StreamHandler`] that forwards its messages into a bounded
/// channel exposed as a [`Stream`], for callers who prefer consuming a
/// stream over implementing the trait.
pub struct ChannelStreamHandler {
    id: String,
    subscribe_data: Value,
    tx: mpsc::Sender<InboundMessage>,
}

impl ChannelStreamHandler {
    /// Create a handler and the stream it feeds. `subscribe_data` becomes
    /// the body of the subscribe request.
    pub fn new<S: Into<String>>(
        id: S,
        subscribe_data: Value,
    ) -> (Arc<Self>, impl Stream<Item = InboundMessage>) {
        let (tx, mut rx) = mpsc::channel(DEFAULT_CHANNEL_CAPACITY);
        let handler = Arc::new(Self {
            id: id.into(),
            subscribe_data,
            tx,
        });

        let stream = async_stream::stream! {
            while let Some(message) = rx.recv().await {
                yield message;
            }
        };

        (handler, stream)
    }
}

#[async_trait]
impl StreamHandler for ChannelStreamHandler {
    fn id(&self) -> &str {
        &self.id
    }

    fn subscribe_message(&self) -> OutboundMessage {
        OutboundMessage::subscribe(&*self.id, self.subscribe_data.clone())
    }

    async fn on_message(&self, message: InboundMessage) {
        if self.tx.send(message).await.is_err() {
            tracing::debug!(stream_id = %self.id, "stream receiver dropped, discarding message");
        }
    }
}
