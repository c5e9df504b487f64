//! Plain WebSocket adapter: frames go through untouched, messages are written as JSON text.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::protocol::Command;
use super::socket::{self, Driver, Inbound, InboundFilter};
use super::traits::{Socket, SocketHandle, SocketTransport};
use crate::Result;
use crate::types::{ChannelDescriptor, Frame};

/// Opens plain WebSocket connections.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct RawTransport;

#[async_trait]
impl SocketTransport for RawTransport {
    async fn open(&self, endpoint: &str) -> Result<Socket> {
        let (driver, events) = socket::connect(endpoint, PassThrough, None).await?;

        Ok(Socket::new(Arc::new(RawSocket { driver }), events))
    }
}

struct PassThrough;

impl InboundFilter for PassThrough {
    fn classify(&mut self, frame: Frame) -> Inbound {
        Inbound::Deliver(frame)
    }
}

struct RawSocket {
    driver: Driver,
}

impl SocketHandle for RawSocket {
    fn subscribe(&self, channel: &ChannelDescriptor) -> Result<()> {
        self.driver
            .send_text(Command::subscribe(channel)?.to_json()?)
    }

    fn send(&self, message: &Value) -> Result<()> {
        self.driver.send_text(serde_json::to_string(message)?)
    }

    fn close(&self, code: u16, reason: &str) {
        self.driver.close(code, reason);
    }

    fn is_open(&self) -> bool {
        self.driver.is_open()
    }
}
