//! Transport contract between the connection manager and socket adapters.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;
use crate::types::{ChannelDescriptor, Frame};

/// Close code for an intentional, normal shutdown (RFC 6455 section 7.4.1).
pub const NORMAL_CLOSURE: u16 = 1000;

/// Something that happened on an opened socket, in the order it happened.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// Inbound application payload
    Message(Frame),
    /// Transport failure; a `Closed` event follows
    Error(String),
    /// The server refused the channel subscription; a `Closed` event follows
    Rejected(String),
    /// The socket is gone. Always the last event.
    Closed { code: Option<u16>, reason: String },
}

/// Write side of an opened socket. Calls never block.
pub trait SocketHandle: Send + Sync + 'static {
    /// Subscribes the socket to `channel`. Sent once, right after the handshake.
    fn subscribe(&self, channel: &ChannelDescriptor) -> Result<()>;

    /// Queues an application message.
    fn send(&self, message: &Value) -> Result<()>;

    /// Starts a graceful close. Idempotent.
    fn close(&self, code: u16, reason: &str);

    fn is_open(&self) -> bool;
}

/// An opened socket: the handle to write with and the stream of what it receives.
pub struct Socket {
    pub handle: Arc<dyn SocketHandle>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

impl Socket {
    #[must_use]
    pub fn new(handle: Arc<dyn SocketHandle>, events: mpsc::UnboundedReceiver<SocketEvent>) -> Self {
        Self { handle, events }
    }
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("open", &self.handle.is_open())
            .finish_non_exhaustive()
    }
}

/// Opens sockets to a fully built endpoint (token already embedded).
///
/// Returning `Ok` means the handshake completed. The manager bounds the call with its
/// handshake timeout, so implementations need not time out on their own.
#[async_trait]
pub trait SocketTransport: Send + Sync + 'static {
    async fn open(&self, endpoint: &str) -> Result<Socket>;
}
