use serde::Deserialize;
use serde_json::Value;

/// Inbound message envelope.
///
/// `data` is the raw body of the frame; what it contains for a given
/// [`InboundMessageType`] is part of the domain contract between the caller
/// and the server, not of this crate.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub message_type: InboundMessageType,
    /// Correlation identifier echoed from the originating request, when any
    pub req_id: Option<String>,
    pub data: Value,
}

impl InboundMessage {
    #[must_use]
    pub fn new(message_type: InboundMessageType, req_id: Option<String>, data: Value) -> Self {
        Self {
            message_type,
            req_id,
            data,
        }
    }

    /// Interpret the body of an `error` frame.
    ///
    /// Returns `None` for non-error frames and for error frames whose body
    /// does not match the documented shape.
    #[must_use]
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.message_type != InboundMessageType::Error {
            return None;
        }

        serde_json::from_value(self.data.clone()).ok()
    }
}

/// The set of inbound message types this client understands.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum InboundMessageType {
    /// Acknowledgement that a subscribe request is now live
    Subscribed,
    /// Acknowledgement that a stream was torn down
    Unsubscribed,
    /// A server-pushed message belonging to a stream
    Data,
    /// Periodic liveness marker for a stream with no traffic
    Progress,
    /// Server liveness check
    Ping,
    /// Request-correlated failure report
    Error,
}

impl InboundMessageType {
    const ALL: [Self; 6] = [
        Self::Subscribed,
        Self::Unsubscribed,
        Self::Data,
        Self::Progress,
        Self::Ping,
        Self::Error,
    ];

    /// The wire spelling of this type.
    #[must_use]
    pub const fn wire_name(self) -> &'static str {
        match self {
            Self::Subscribed => "subscribed",
            Self::Unsubscribed => "unsubscribed",
            Self::Data => "data",
            Self::Progress => "progress",
            Self::Ping => "ping",
            Self::Error => "error",
        }
    }

    /// Match a raw `type` field against the known set, ignoring ASCII case.
    #[must_use]
    pub fn from_wire(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.wire_name().eq_ignore_ascii_case(raw))
    }
}

/// Body of an `error` frame.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Outcome of parsing a raw text frame.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum ParsedFrame {
    /// A well-formed frame of a recognized type
    Message(InboundMessage),
    /// Valid JSON whose `type` is missing or unknown; routed to the
    /// invalid-message side channel
    Unrecognized(Value),
}

/// Parse a raw text frame from the transport.
///
/// Returns `None` when the frame is not valid JSON; the wire contract
/// guarantees structured frames from a well-behaved peer, so such frames
/// are dropped by the caller rather than surfaced.
#[must_use]
pub fn parse_frame(text: &str) -> Option<ParsedFrame> {
    let value: Value = serde_json::from_str(text).ok()?;

    let message_type = value
        .get("type")
        .and_then(Value::as_str)
        .and_then(InboundMessageType::from_wire);

    let Some(message_type) = message_type else {
        return Some(ParsedFrame::Unrecognized(value));
    };

    let req_id = value
        .get("req_id")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let data = value.get("data").cloned().unwrap_or(Value::Null);

    Some(ParsedFrame::Message(InboundMessage {
        message_type,
        req_id,
        data,
    }))
}
