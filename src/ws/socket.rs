//! tokio-tungstenite IO driver shared by the socket adapters.
//!
//! One task per socket owns the stream. Writes arrive over an unbounded channel, reads are
//! classified by the adapter's [`Inbound`] filter and forwarded as [`SocketEvent`]s.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::error::WsError;
use super::traits::{NORMAL_CLOSURE, SocketEvent};
use crate::Result;
use crate::types::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Idle window used when the adapter does not ask for stale detection.
const IDLE_FOREVER: Duration = Duration::from_secs(24 * 60 * 60);

/// What the driver should do with an inbound data frame.
#[derive(Debug)]
pub(crate) enum Inbound {
    Deliver(Frame),
    Ignore,
    Error(String),
    Reject(String),
    Close(String),
}

/// Adapter-specific interpretation of inbound frames. Runs on the IO task.
pub(crate) trait InboundFilter: Send + 'static {
    fn classify(&mut self, frame: Frame) -> Inbound;
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Close { code: u16, reason: String },
}

/// Write side of a driven socket.
#[derive(Debug)]
pub(crate) struct Driver {
    outgoing: mpsc::UnboundedSender<Outgoing>,
    open: Arc<AtomicBool>,
}

impl Driver {
    pub(crate) fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() {
            return Err(WsError::ConnectionClosed.into());
        }
        self.outgoing
            .send(Outgoing::Text(text))
            .map_err(|_e| WsError::ConnectionClosed)?;
        Ok(())
    }

    pub(crate) fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            _ = self.outgoing.send(Outgoing::Close {
                code,
                reason: reason.to_owned(),
            });
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Performs the handshake and spawns the IO task.
///
/// With `stale_after` set, a socket that receives nothing for that long is closed.
pub(crate) async fn connect<F: InboundFilter>(
    endpoint: &str,
    filter: F,
    stale_after: Option<Duration>,
) -> Result<(Driver, mpsc::UnboundedReceiver<SocketEvent>)> {
    let (ws_stream, _) = connect_async(endpoint).await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
    let open = Arc::new(AtomicBool::new(true));

    let task_open = Arc::clone(&open);
    tokio::spawn(async move {
        run(ws_stream, outgoing_rx, events_tx, filter, task_open, stale_after).await;
    });

    Ok((
        Driver {
            outgoing: outgoing_tx,
            open,
        },
        events_rx,
    ))
}

async fn run<F: InboundFilter>(
    ws_stream: WsStream,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    mut filter: F,
    open: Arc<AtomicBool>,
    stale_after: Option<Duration>,
) {
    let (mut write, mut read) = ws_stream.split();
    let idle = stale_after.unwrap_or(IDLE_FOREVER);
    let stale = sleep(idle);
    tokio::pin!(stale);

    let (code, reason) = loop {
        tokio::select! {
            msg = read.next() => {
                let frame = match msg {
                    Some(Ok(Message::Text(text))) => Frame::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => Frame::Binary(bytes.to_vec()),
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                    }
                    Some(Ok(_)) => {
                        // Ping/pong are answered by tungstenite; they still prove liveness.
                        stale.as_mut().reset(Instant::now() + idle);
                        continue;
                    }
                    Some(Err(e)) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(error = %e, "WebSocket read failed");
                        _ = events_tx.send(SocketEvent::Error(e.to_string()));
                        break (None, e.to_string());
                    }
                    None => break (None, "stream ended".to_owned()),
                };

                stale.as_mut().reset(Instant::now() + idle);
                match filter.classify(frame) {
                    Inbound::Deliver(frame) => {
                        #[cfg(feature = "tracing")]
                        tracing::trace!(bytes = frame.as_bytes().len(), "Received WebSocket frame");
                        _ = events_tx.send(SocketEvent::Message(frame));
                    }
                    Inbound::Ignore => {}
                    Inbound::Error(error) => {
                        _ = events_tx.send(SocketEvent::Error(error));
                    }
                    Inbound::Reject(reason) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%reason, "Subscription rejected, closing socket");
                        open.store(false, Ordering::Release);
                        _ = events_tx.send(SocketEvent::Rejected(reason.clone()));
                        close_quietly(&mut write, NORMAL_CLOSURE, &reason).await;
                        break (Some(NORMAL_CLOSURE), reason);
                    }
                    Inbound::Close(reason) => {
                        open.store(false, Ordering::Release);
                        close_quietly(&mut write, NORMAL_CLOSURE, &reason).await;
                        break (Some(NORMAL_CLOSURE), reason);
                    }
                }
            }

            out = outgoing_rx.recv() => {
                match out {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = write.send(Message::Text(text.into())).await {
                            _ = events_tx.send(SocketEvent::Error(e.to_string()));
                            break (None, e.to_string());
                        }
                    }
                    Some(Outgoing::Close { code, reason }) => {
                        close_quietly(&mut write, code, &reason).await;
                        break (Some(code), reason);
                    }
                    None => {
                        close_quietly(&mut write, NORMAL_CLOSURE, "").await;
                        break (Some(NORMAL_CLOSURE), "socket handle dropped".to_owned());
                    }
                }
            }

            () = &mut stale, if stale_after.is_some() => {
                #[cfg(feature = "tracing")]
                tracing::warn!(?idle, "No traffic within stale threshold, closing socket");
                open.store(false, Ordering::Release);
                close_quietly(&mut write, NORMAL_CLOSURE, "stale connection").await;
                break (None, "stale connection".to_owned());
            }
        }
    };

    open.store(false, Ordering::Release);
    _ = events_tx.send(SocketEvent::Closed { code, reason });
}

async fn close_quietly<S>(write: &mut S, code: u16, reason: &str)
where
    S: futures::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: code.into(),
        reason: reason.to_owned().into(),
    };
    _ = write.send(Message::Close(Some(frame))).await;
}
