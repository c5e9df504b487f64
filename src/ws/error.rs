#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// WebSocket error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the WebSocket server
    #[cfg(any(feature = "raw", feature = "cable"))]
    Connection(tokio_tungstenite::tungstenite::Error),
    /// The transport refused or could not complete the handshake
    Handshake(String),
    /// WebSocket connection was closed
    ConnectionClosed,
    /// Operation timed out
    Timeout,
    /// The server refused the channel subscription
    SubscriptionRejected(String),
    /// Received or asked to send an invalid message
    InvalidMessage(String),
    /// The selected transport was compiled out
    TransportUnavailable(&'static str),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(any(feature = "raw", feature = "cable"))]
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Handshake(reason) => write!(f, "WebSocket handshake failed: {reason}"),
            Self::ConnectionClosed => write!(f, "WebSocket connection closed"),
            Self::Timeout => write!(f, "WebSocket operation timed out"),
            Self::SubscriptionRejected(identifier) => {
                write!(f, "Subscription rejected: {identifier}")
            }
            Self::InvalidMessage(msg) => write!(f, "Invalid WebSocket message: {msg}"),
            Self::TransportUnavailable(feature) => {
                write!(f, "Transport unavailable, enable the `{feature}` feature")
            }
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            #[cfg(any(feature = "raw", feature = "cable"))]
            Self::Connection(e) => Some(e),
            _ => None,
        }
    }
}

// Integration with main Error type
impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

#[cfg(any(feature = "raw", feature = "cable"))]
impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::Transport, WsError::Connection(e))
    }
}
