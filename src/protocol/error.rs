#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Protocol-level error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum ProtocolError {
    /// Error connecting to or communicating with the controller
    Connection(tokio_tungstenite::tungstenite::Error),
    /// Error parsing an inbound frame
    MessageParse(serde_json::Error),
    /// Connection was torn down while the request was pending
    ConnectionClosed,
    /// No connection exists for the requested operation
    NotConnected,
    /// A `result` frame carried an error payload
    Remote {
        /// Machine-readable error code from the controller
        code: String,
        /// Human-readable description
        message: String,
    },
    /// Received an invalid or unexpected frame
    InvalidMessage(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "connection error: {e}"),
            Self::MessageParse(e) => write!(f, "failed to parse inbound frame: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::NotConnected => write!(f, "not connected"),
            Self::Remote { code, message } => write!(f, "controller error {code}: {message}"),
            Self::InvalidMessage(msg) => write!(f, "invalid frame: {msg}"),
        }
    }
}

impl StdError for ProtocolError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::MessageParse(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<ProtocolError> for crate::error::Error {
    fn from(e: ProtocolError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(
            crate::error::Kind::WebSocket,
            ProtocolError::Connection(e),
        )
    }
}
