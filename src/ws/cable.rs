//! ActionCable consumer adapter.
//!
//! The server speaks the cable protocol: it greets with `welcome`, pings every few seconds,
//! confirms or rejects subscriptions, and wraps channel broadcasts in
//! `{"identifier": ..., "message": ...}`. Listeners only ever see the unwrapped `message`.
//! Outgoing messages become `perform("receive", message)` calls on the subscribed channel.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::error::WsError;
use super::protocol::{Command, ControlKind, Envelope, RECEIVE_ACTION};
use super::socket::{self, Driver, Inbound, InboundFilter};
use super::traits::{Socket, SocketHandle, SocketTransport};
use crate::Result;
use crate::types::{ChannelDescriptor, Frame};

/// Servers ping every 3 seconds; two missed pings mean the socket is dead.
const DEFAULT_STALE_THRESHOLD: Duration = Duration::from_secs(6);

/// Opens ActionCable connections.
///
/// The manager reports a conversation `Connected` once the socket handshake completes and
/// the subscribe command is queued. It does not wait for `confirm_subscription`, so
/// [`ConnectionManager::is_connected`](super::ConnectionManager::is_connected) can be true
/// for a moment before the server confirms. A later `reject_subscription` moves the
/// conversation to `Error`.
#[non_exhaustive]
#[derive(Clone, Copy, Debug)]
pub struct CableTransport {
    /// Silence after which the socket is considered dead and closed
    pub stale_threshold: Duration,
}

impl CableTransport {
    #[must_use]
    pub const fn new(stale_threshold: Duration) -> Self {
        Self { stale_threshold }
    }
}

impl Default for CableTransport {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_THRESHOLD)
    }
}

#[async_trait]
impl SocketTransport for CableTransport {
    async fn open(&self, endpoint: &str) -> Result<Socket> {
        let identifier = Arc::new(OnceLock::new());
        let filter = CableFilter {
            identifier: Arc::clone(&identifier),
        };
        let (driver, events) =
            socket::connect(endpoint, filter, Some(self.stale_threshold)).await?;

        Ok(Socket::new(
            Arc::new(CableSocket { driver, identifier }),
            events,
        ))
    }
}

struct CableFilter {
    identifier: Arc<OnceLock<String>>,
}

impl InboundFilter for CableFilter {
    fn classify(&mut self, frame: Frame) -> Inbound {
        let envelope = match frame.json::<Envelope>() {
            Ok(envelope) => envelope,
            Err(e) => return Inbound::Error(format!("unreadable cable frame: {e}")),
        };

        match envelope.kind {
            Some(ControlKind::Welcome | ControlKind::Ping) => Inbound::Ignore,
            Some(ControlKind::ConfirmSubscription) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(identifier = ?envelope.identifier, "Subscription confirmed");
                Inbound::Ignore
            }
            Some(ControlKind::RejectSubscription) => {
                let identifier = envelope.identifier.unwrap_or_default();
                Inbound::Reject(WsError::SubscriptionRejected(identifier).to_string())
            }
            Some(ControlKind::Disconnect) => Inbound::Close(
                envelope
                    .reason
                    .unwrap_or_else(|| "server requested disconnect".to_owned()),
            ),
            Some(ControlKind::Unknown) => Inbound::Ignore,
            None => match (envelope.identifier, envelope.message) {
                (Some(identifier), Some(message))
                    if self.identifier.get() == Some(&identifier) =>
                {
                    Inbound::Deliver(Frame::Text(message.to_string()))
                }
                _ => Inbound::Ignore,
            },
        }
    }
}

struct CableSocket {
    driver: Driver,
    identifier: Arc<OnceLock<String>>,
}

impl SocketHandle for CableSocket {
    fn subscribe(&self, channel: &ChannelDescriptor) -> Result<()> {
        let command = Command::subscribe(channel)?;
        if self.identifier.set(command.identifier.clone()).is_err() {
            return Err(WsError::InvalidMessage("socket already subscribed".to_owned()).into());
        }
        self.driver.send_text(command.to_json()?)
    }

    fn send(&self, message: &Value) -> Result<()> {
        let Some(identifier) = self.identifier.get() else {
            return Err(WsError::InvalidMessage("send before subscribe".to_owned()).into());
        };
        self.driver
            .send_text(Command::perform(identifier, RECEIVE_ACTION, message)?.to_json()?)
    }

    fn close(&self, code: u16, reason: &str) {
        if let Some(identifier) = self.identifier.get()
            && self.driver.is_open()
            && let Ok(unsubscribe) = Command::unsubscribe(identifier).to_json()
        {
            _ = self.driver.send_text(unsubscribe);
        }
        self.driver.close(code, reason);
    }

    fn is_open(&self) -> bool {
        self.driver.is_open()
    }
}
