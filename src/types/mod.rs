//! The JSON message envelope exchanged with the event server.
//!
//! Every frame is a JSON object carrying at least a `type` string; replies
//! to correlated requests echo the request's `req_id`. Payload shapes beyond
//! the envelope are opaque to this crate and are handed to stream handlers
//! as raw [`serde_json::Value`]s.

pub mod request;
pub mod response;

pub use request::{OutboundMessage, OutboundMessageType};
pub use response::{ErrorPayload, InboundMessage, InboundMessageType, ParsedFrame, parse_frame};
