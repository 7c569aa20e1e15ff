use serde::Serialize;
use serde_json::Value;

/// Outbound request envelope.
///
/// `req_id` is the caller-chosen correlation identifier echoed back by the
/// server on every reply belonging to the request. `data` carries the
/// domain-specific body and is opaque to this crate.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub message_type: OutboundMessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl OutboundMessage {
    /// Create a subscribe request correlated by `req_id`.
    #[must_use]
    pub fn subscribe<S: Into<String>>(req_id: S, data: Value) -> Self {
        Self {
            message_type: OutboundMessageType::Subscribe,
            req_id: Some(req_id.into()),
            data,
        }
    }

    /// Create an unsubscribe request for a previously subscribed `req_id`.
    #[must_use]
    pub fn unsubscribe<S: Into<String>>(req_id: S) -> Self {
        Self {
            message_type: OutboundMessageType::Unsubscribe,
            req_id: Some(req_id.into()),
            data: Value::Null,
        }
    }

    /// Create a keep-alive frame. Not correlated.
    #[must_use]
    pub fn keep_alive() -> Self {
        Self {
            message_type: OutboundMessageType::Pong,
            req_id: None,
            data: Value::Null,
        }
    }
}

/// Outbound message type.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, strum_macros::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum OutboundMessageType {
    /// Open a logical stream
    Subscribe,
    /// Close a logical stream
    Unsubscribe,
    /// Keep-alive answer to server liveness checks
    Pong,
}
