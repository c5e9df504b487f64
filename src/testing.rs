//! Reusable test utilities for exercising the connection manager without a real socket.
//!
//! [`MockTransport`] records every open request and hands out in-memory sockets. Each
//! accepted socket has a [`MockServer`] handle that tests use to read what the client
//! wrote, push inbound frames, or drop the connection from the server side.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::Result;
use crate::types::{ChannelDescriptor, Frame};
use crate::ws::WsError;
use crate::ws::protocol::Command;
use crate::ws::traits::{NORMAL_CLOSURE, Socket, SocketEvent, SocketHandle, SocketTransport};

/// Close code reported when the server side drops a socket without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How the next `open` call behaves.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Complete the handshake immediately
    #[default]
    Accept,
    /// Complete the handshake after the given delay
    AcceptAfter(Duration),
    /// Refuse the handshake
    Fail,
    /// Never complete; only the manager's handshake timeout ends the attempt
    Hang,
}

/// Something the transport observed, in order.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// `open` was called; `index` counts every call, successful or not
    OpenRequested { index: usize, endpoint: String },
    /// The client closed socket `index`
    Closed {
        index: usize,
        code: u16,
        reason: String,
    },
    /// The server side dropped socket `index`
    Dropped { index: usize },
}

/// A transport that uses in-memory channels so tests can emulate server behavior.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    script: Mutex<VecDeque<OpenBehavior>>,
    fallback: Mutex<OpenBehavior>,
    endpoints: Mutex<Vec<String>>,
    servers: Mutex<Vec<MockServer>>,
    log: Arc<Mutex<Vec<TransportEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the behavior of the next unscripted `open` call.
    pub fn push_behavior(&self, behavior: OpenBehavior) {
        lock(&self.shared.script).push_back(behavior);
    }

    /// Behavior once the queue is empty. Defaults to [`OpenBehavior::Accept`].
    pub fn set_fallback(&self, behavior: OpenBehavior) {
        *lock(&self.shared.fallback) = behavior;
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        lock(&self.shared.endpoints).len()
    }

    /// Endpoints passed to `open`, in call order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.shared.endpoints).clone()
    }

    /// Server handle of the socket created by open call `index`.
    #[must_use]
    pub fn server(&self, index: usize) -> Option<MockServer> {
        lock(&self.shared.servers)
            .iter()
            .find(|server| server.index == index)
            .cloned()
    }

    /// Server handle of the most recently accepted socket.
    #[must_use]
    pub fn last_server(&self) -> Option<MockServer> {
        lock(&self.shared.servers).last().cloned()
    }

    #[must_use]
    pub fn events(&self) -> Vec<TransportEvent> {
        lock(&self.shared.log).clone()
    }
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport")
            .field("open_count", &self.open_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SocketTransport for MockTransport {
    async fn open(&self, endpoint: &str) -> Result<Socket> {
        let index = {
            let mut endpoints = lock(&self.shared.endpoints);
            endpoints.push(endpoint.to_owned());
            endpoints.len() - 1
        };
        lock(&self.shared.log).push(TransportEvent::OpenRequested {
            index,
            endpoint: endpoint.to_owned(),
        });

        let scripted = lock(&self.shared.script).pop_front();
        let behavior = scripted.unwrap_or_else(|| *lock(&self.shared.fallback));
        match behavior {
            OpenBehavior::Accept => {}
            OpenBehavior::AcceptAfter(delay) => tokio::time::sleep(delay).await,
            OpenBehavior::Fail => {
                return Err(WsError::Handshake(format!("mock open {index} refused")).into());
            }
            OpenBehavior::Hang => futures::future::pending::<()>().await,
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(SocketState {
            index,
            open: AtomicBool::new(true),
            outbound: Mutex::new(Vec::new()),
            closed_with: Mutex::new(None),
            events_tx,
            log: Arc::clone(&self.shared.log),
        });
        lock(&self.shared.servers).push(MockServer {
            index,
            state: Arc::clone(&state),
        });

        Ok(Socket::new(Arc::new(MockSocket { state }), events_rx))
    }
}

struct SocketState {
    index: usize,
    open: AtomicBool,
    outbound: Mutex<Vec<String>>,
    closed_with: Mutex<Option<(u16, String)>>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    log: Arc<Mutex<Vec<TransportEvent>>>,
}

/// Error surface for operations on [`MockServer`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MockServerError {
    /// The client no longer reads this socket's events.
    ChannelClosed,
}

impl fmt::Display for MockServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChannelClosed => f.write_str("mock socket is no longer read by the client"),
        }
    }
}

impl std::error::Error for MockServerError {}

/// Server-side test handle of one accepted socket.
#[derive(Clone)]
pub struct MockServer {
    index: usize,
    state: Arc<SocketState>,
}

impl MockServer {
    /// Open call that created this socket.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Text frames written by the client, subscribe frame first.
    #[must_use]
    pub fn outbound(&self) -> Vec<String> {
        lock(&self.state.outbound).clone()
    }

    /// Pushes an inbound text frame, even after the socket closed.
    pub fn send_text<S: Into<String>>(&self, text: S) -> std::result::Result<(), MockServerError> {
        self.send_frame(Frame::Text(text.into()))
    }

    pub fn send_frame(&self, frame: Frame) -> std::result::Result<(), MockServerError> {
        self.push(SocketEvent::Message(frame))
    }

    /// Reports a transport error without closing the socket.
    pub fn send_error<S: Into<String>>(&self, error: S) -> std::result::Result<(), MockServerError> {
        self.push(SocketEvent::Error(error.into()))
    }

    /// Simulates the server dropping the connection.
    pub fn drop_socket(&self) {
        if self.state.open.swap(false, Ordering::AcqRel) {
            lock(&self.state.log).push(TransportEvent::Dropped { index: self.index });
            _ = self.state.events_tx.send(SocketEvent::Closed {
                code: Some(ABNORMAL_CLOSURE),
                reason: "connection dropped".to_owned(),
            });
        }
    }

    /// Refuses the channel subscription and closes the socket, like a cable server would.
    pub fn reject_subscription<S: Into<String>>(&self, reason: S) {
        if self.state.open.swap(false, Ordering::AcqRel) {
            let reason = reason.into();
            _ = self.state.events_tx.send(SocketEvent::Rejected(reason.clone()));
            _ = self.state.events_tx.send(SocketEvent::Closed {
                code: Some(NORMAL_CLOSURE),
                reason,
            });
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }

    /// Code and reason of the client's close, if it closed this socket.
    #[must_use]
    pub fn close_frame(&self) -> Option<(u16, String)> {
        lock(&self.state.closed_with).clone()
    }

    fn push(&self, event: SocketEvent) -> std::result::Result<(), MockServerError> {
        self.state
            .events_tx
            .send(event)
            .map_err(|_e| MockServerError::ChannelClosed)
    }
}

impl fmt::Debug for MockServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockServer")
            .field("index", &self.index)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

/// Client side of an in-memory socket.
struct MockSocket {
    state: Arc<SocketState>,
}

impl MockSocket {
    fn write(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed.into());
        }
        lock(&self.state.outbound).push(text);
        Ok(())
    }
}

impl SocketHandle for MockSocket {
    fn subscribe(&self, channel: &ChannelDescriptor) -> Result<()> {
        self.write(Command::subscribe(channel)?.to_json()?)
    }

    fn send(&self, message: &Value) -> Result<()> {
        self.write(serde_json::to_string(message)?)
    }

    fn close(&self, code: u16, reason: &str) {
        if self.state.open.swap(false, Ordering::AcqRel) {
            *lock(&self.state.closed_with) = Some((code, reason.to_owned()));
            lock(&self.state.log).push(TransportEvent::Closed {
                index: self.state.index,
                code,
                reason: reason.to_owned(),
            });
            _ = self.state.events_tx.send(SocketEvent::Closed {
                code: Some(code),
                reason: reason.to_owned(),
            });
        }
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::Acquire)
    }
}
