#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

/// Connection error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum ConnectionError {
    /// Error establishing or communicating over the transport
    Transport(tokio_tungstenite::tungstenite::Error),
    /// The configured endpoint is not a valid URL
    InvalidUrl(url::ParseError),
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "transport error: {e}"),
            Self::InvalidUrl(e) => write!(f, "invalid endpoint URL: {e}"),
        }
    }
}

impl StdError for ConnectionError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            Self::InvalidUrl(e) => Some(e),
        }
    }
}

// Integration with main Error type
impl From<ConnectionError> for crate::error::Error {
    fn from(e: ConnectionError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Connection, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Connection, ConnectionError::Transport(e))
    }
}

/// Failure of the single in-flight connection attempt, cloned to every
/// caller that was sharing it.
#[derive(Clone, Debug)]
pub struct ConnectFailed(pub(crate) Arc<crate::error::Error>);

impl fmt::Display for ConnectFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection attempt failed: {}", self.0)
    }
}

impl StdError for ConnectFailed {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.0.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<ConnectFailed> for crate::error::Error {
    fn from(e: ConnectFailed) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Connection, e)
    }
}
