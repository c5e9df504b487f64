#![cfg(all(feature = "raw", feature = "cable"))]
#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chat_realtime::auth::StaticToken;
use chat_realtime::network::AlwaysOnline;
use chat_realtime::types::{ChannelDescriptor, ConnectionStatus, ConversationId, Frame};
use chat_realtime::ws::cable::CableTransport;
use chat_realtime::ws::config::{Config, Platform, TransportKind};
use chat_realtime::ws::raw::RawTransport;
use chat_realtime::ws::{ConnectionManager, Socket, SocketEvent, SocketTransport as _};
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

const SUBSCRIBE_42: &str =
    r#"{"command":"subscribe","identifier":"{\"channel\":\"ChatChannel\",\"chat_id\":42}"}"#;
const IDENTIFIER_42: &str = r#"{"channel":"ChatChannel","chat_id":42}"#;
const CHAT: ConversationId = ConversationId(42);

/// Mock WebSocket server.
struct MockWsServer {
    addr: SocketAddr,
    /// Broadcast frames to ALL connected clients
    message_tx: broadcast::Sender<Message>,
    /// Text and close frames received from clients
    received_rx: mpsc::UnboundedReceiver<Message>,
    /// Request URIs of accepted handshakes
    uri_rx: mpsc::UnboundedReceiver<String>,
}

impl MockWsServer {
    /// Start a mock WebSocket server on a random port.
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (message_tx, _) = broadcast::channel::<Message>(100);
        let (received_tx, received_rx) = mpsc::unbounded_channel::<Message>();
        let (uri_tx, uri_rx) = mpsc::unbounded_channel::<String>();

        let broadcast_tx = message_tx.clone();

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let uri_tx = uri_tx.clone();
                let callback = move |request: &Request, response: Response| {
                    drop(uri_tx.send(request.uri().to_string()));
                    Ok::<_, ErrorResponse>(response)
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                let (mut write, mut read) = ws_stream.split();
                let received_tx = received_tx.clone();
                let mut msg_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(msg @ (Message::Text(_) | Message::Close(_)))) => {
                                        let closing = msg.is_close();
                                        drop(received_tx.send(msg));
                                        if closing {
                                            break;
                                        }
                                    }
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            msg = msg_rx.recv() => {
                                match msg {
                                    Ok(msg) => {
                                        if write.send(msg).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                        }
                    }
                });
            }
        });

        Self {
            addr,
            message_tx,
            received_rx,
            uri_rx,
        }
    }

    fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    fn send(&self, text: &str) {
        drop(self.message_tx.send(Message::Text(text.to_owned().into())));
    }

    fn send_close(&self, code: CloseCode, reason: &str) {
        let frame = CloseFrame {
            code,
            reason: reason.to_owned().into(),
        };
        drop(self.message_tx.send(Message::Close(Some(frame))));
    }

    async fn recv(&mut self) -> Option<Message> {
        timeout(Duration::from_secs(2), self.received_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Receive the next text frame written by a client.
    async fn recv_text(&mut self) -> Option<String> {
        match self.recv().await? {
            Message::Text(text) => Some(text.as_str().to_owned()),
            _ => None,
        }
    }

    /// Receive the next close frame written by a client.
    async fn recv_close(&mut self) -> Option<(u16, String)> {
        match self.recv().await? {
            Message::Close(Some(frame)) => Some((u16::from(frame.code), frame.reason.as_str().to_owned())),
            _ => None,
        }
    }

    async fn recv_uri(&mut self) -> Option<String> {
        timeout(Duration::from_secs(2), self.uri_rx.recv())
            .await
            .ok()
            .flatten()
    }
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SocketEvent>) -> SocketEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap()
}

mod raw {
    use super::*;

    #[tokio::test]
    async fn subscribes_sends_and_receives_verbatim() {
        let mut server = MockWsServer::start().await;

        let Socket { handle, mut events } = RawTransport::default()
            .open(&server.ws_url("/cable?token=abc"))
            .await
            .unwrap();
        assert_eq!(server.recv_uri().await.unwrap(), "/cable?token=abc");

        handle.subscribe(&ChannelDescriptor::chat(CHAT)).unwrap();
        assert_eq!(server.recv_text().await.unwrap(), SUBSCRIBE_42);

        server.send(r#"{"body":"hi"}"#);
        assert_eq!(
            next_event(&mut events).await,
            SocketEvent::Message(Frame::from(r#"{"body":"hi"}"#))
        );

        handle.send(&json!({ "body": "yo" })).unwrap();
        assert_eq!(server.recv_text().await.unwrap(), r#"{"body":"yo"}"#);

        handle.close(1000, "Normal closure");
        assert!(!handle.is_open());
        assert_eq!(
            server.recv_close().await,
            Some((1000, "Normal closure".to_owned()))
        );
        assert_eq!(
            next_event(&mut events).await,
            SocketEvent::Closed {
                code: Some(1000),
                reason: "Normal closure".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn server_close_ends_the_socket() {
        let mut server = MockWsServer::start().await;

        let Socket { handle, mut events } = RawTransport::default()
            .open(&server.ws_url("/cable"))
            .await
            .unwrap();
        handle.subscribe(&ChannelDescriptor::chat(CHAT)).unwrap();
        server.recv_text().await.unwrap();

        server.send_close(CloseCode::Away, "bye");

        assert_eq!(
            next_event(&mut events).await,
            SocketEvent::Closed {
                code: Some(1001),
                reason: "bye".to_owned()
            }
        );
        assert!(!handle.is_open());
        handle.send(&json!({ "body": "late" })).unwrap_err();
    }

    #[tokio::test]
    async fn refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RawTransport::default()
            .open(&format!("ws://{addr}/cable"))
            .await;

        assert!(result.is_err());
    }
}

mod cable {
    use super::*;

    #[tokio::test]
    async fn unwraps_channel_broadcasts_and_performs_receive() {
        let mut server = MockWsServer::start().await;

        let Socket { handle, mut events } = CableTransport::default()
            .open(&server.ws_url("/cable"))
            .await
            .unwrap();
        handle.subscribe(&ChannelDescriptor::chat(CHAT)).unwrap();
        assert_eq!(server.recv_text().await.unwrap(), SUBSCRIBE_42);

        server.send(r#"{"type":"welcome"}"#);
        server.send(
            &json!({ "type": "confirm_subscription", "identifier": IDENTIFIER_42 }).to_string(),
        );
        server.send(&json!({ "identifier": "someone else", "message": { "body": "no" } }).to_string());
        server.send(&json!({ "identifier": IDENTIFIER_42, "message": { "body": "hi" } }).to_string());

        assert_eq!(
            next_event(&mut events).await,
            SocketEvent::Message(Frame::from(r#"{"body":"hi"}"#))
        );

        handle.send(&json!({ "body": "yo" })).unwrap();
        assert_eq!(
            server.recv_text().await.unwrap(),
            r#"{"command":"message","identifier":"{\"channel\":\"ChatChannel\",\"chat_id\":42}","data":"{\"body\":\"yo\",\"action\":\"receive\"}"}"#
        );

        handle.close(1000, "Normal closure");
        assert_eq!(
            server.recv_text().await.unwrap(),
            r#"{"command":"unsubscribe","identifier":"{\"channel\":\"ChatChannel\",\"chat_id\":42}"}"#
        );
        assert_eq!(
            server.recv_close().await,
            Some((1000, "Normal closure".to_owned()))
        );
    }

    #[tokio::test]
    async fn rejected_subscription_closes_the_socket() {
        let mut server = MockWsServer::start().await;

        let Socket { handle, mut events } = CableTransport::default()
            .open(&server.ws_url("/cable"))
            .await
            .unwrap();
        handle.subscribe(&ChannelDescriptor::chat(CHAT)).unwrap();
        server.recv_text().await.unwrap();

        server.send(
            &json!({ "type": "reject_subscription", "identifier": IDENTIFIER_42 }).to_string(),
        );

        let SocketEvent::Rejected(rejection) = next_event(&mut events).await else {
            panic!("expected a rejection");
        };
        assert!(rejection.contains(IDENTIFIER_42), "{rejection}");
        let SocketEvent::Closed { code, reason } = next_event(&mut events).await else {
            panic!("expected the socket to close");
        };
        assert_eq!(code, Some(1000));
        assert!(reason.starts_with("Subscription rejected"), "{reason}");
        assert!(!handle.is_open());
    }

    #[tokio::test]
    async fn silent_server_is_detected_as_stale() {
        let mut server = MockWsServer::start().await;

        let Socket { handle, mut events } = CableTransport::new(Duration::from_millis(300))
            .open(&server.ws_url("/cable"))
            .await
            .unwrap();
        handle.subscribe(&ChannelDescriptor::chat(CHAT)).unwrap();
        server.recv_text().await.unwrap();

        assert_eq!(
            next_event(&mut events).await,
            SocketEvent::Closed {
                code: None,
                reason: "stale connection".to_owned()
            }
        );
        assert!(!handle.is_open());
    }
}

mod manager {
    use super::*;

    fn forwarding_listener(tx: mpsc::UnboundedSender<Frame>) -> chat_realtime::ws::Listener {
        Arc::new(move |frame: &Frame| {
            drop(tx.send(frame.clone()));
        })
    }

    #[tokio::test]
    async fn raw_end_to_end() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .endpoint(server.ws_url("/cable"))
            .platform(Platform::Android)
            .build();
        let manager =
            ConnectionManager::new(config, StaticToken::new("a b+c"), AlwaysOnline::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.on_message(CHAT, forwarding_listener(tx));
        manager.connect(CHAT, ChannelDescriptor::chat(CHAT));

        assert!(manager.wait_for_connection(CHAT, Duration::from_secs(2)).await);
        assert_eq!(server.recv_uri().await.unwrap(), "/cable?token=a%20b%2Bc");
        assert_eq!(server.recv_text().await.unwrap(), SUBSCRIBE_42);

        server.send(r#"{"body":"hi"}"#);
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Frame::from(r#"{"body":"hi"}"#));

        manager.close(CHAT);
        assert_eq!(
            server.recv_close().await,
            Some((1000, "Normal closure".to_owned()))
        );
        assert!(!manager.is_connected(CHAT));
    }

    #[tokio::test]
    async fn cable_end_to_end() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .endpoint(server.ws_url("/cable"))
            .transport(TransportKind::Cable)
            .build();
        let manager =
            ConnectionManager::new(config, StaticToken::new("t0k3n"), AlwaysOnline::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        manager.on_message(CHAT, forwarding_listener(tx));
        manager.connect(CHAT, ChannelDescriptor::chat(CHAT));

        assert!(manager.wait_for_connection(CHAT, Duration::from_secs(2)).await);
        assert_eq!(server.recv_text().await.unwrap(), SUBSCRIBE_42);

        server.send(&json!({ "identifier": IDENTIFIER_42, "message": { "body": "hi" } }).to_string());
        let frame = timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.json::<serde_json::Value>().unwrap(), json!({ "body": "hi" }));

        manager.send(CHAT, &json!({ "body": "yo" }));
        let sent: serde_json::Value =
            serde_json::from_str(&server.recv_text().await.unwrap()).unwrap();
        assert_eq!(sent["command"], "message");
        assert_eq!(sent["data"], r#"{"body":"yo","action":"receive"}"#);

        manager.close_all();
    }

    #[tokio::test]
    async fn cable_rejection_is_an_error() {
        let mut server = MockWsServer::start().await;
        let config = Config::builder()
            .endpoint(server.ws_url("/cable"))
            .transport(TransportKind::Cable)
            .build();
        let manager =
            ConnectionManager::new(config, StaticToken::new("t0k3n"), AlwaysOnline::default()).unwrap();

        manager.connect(CHAT, ChannelDescriptor::chat(CHAT));
        assert!(manager.wait_for_connection(CHAT, Duration::from_secs(2)).await);
        assert_eq!(server.recv_uri().await.unwrap(), "/cable?token=t0k3n");
        assert_eq!(server.recv_text().await.unwrap(), SUBSCRIBE_42);

        server.send(
            &json!({ "type": "reject_subscription", "identifier": IDENTIFIER_42 }).to_string(),
        );
        assert_eq!(server.recv_close().await.map(|(code, _)| code), Some(1000));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.status(CHAT), Some(ConnectionStatus::Error));
        assert_eq!(manager.retries(CHAT), Some(1));
        assert!(!manager.is_connected(CHAT));
        assert!(
            timeout(Duration::from_millis(300), server.recv_uri()).await.is_err(),
            "a rejected subscription must not reconnect"
        );
    }
}
