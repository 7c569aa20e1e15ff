//! Logical streams and their multiplexing over one connection.
//!
//! A [`StreamHandler`] describes one identifier-keyed subscription; the
//! [`SubscriptionMultiplexer`] owns the registry, correlates inbound
//! messages to their stream by `req_id`, and resubscribes every stream
//! after a reconnection.

pub mod handler;
pub mod multiplexer;

pub use handler::{ChannelStreamHandler, StreamHandler};
pub use multiplexer::SubscriptionMultiplexer;
