#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};

use super::config::{Config, TransportKind};
use super::endpoint;
use super::error::WsError;
use super::listener::{Listener, ListenerRegistry};
use super::retry::{PendingRetry, RetryDecision, RetryScheduler};
use super::traits::{NORMAL_CLOSURE, Socket, SocketEvent, SocketHandle, SocketTransport};
use crate::Result;
use crate::auth::TokenProvider;
use crate::error::Error;
use crate::network::{ConnectivityProbe, NetworkState};
use crate::types::{ChannelDescriptor, ConnectionStatus, ConversationId, Frame, StatusUpdate};

/// Broadcast channel capacity for status updates.
const BROADCAST_CAPACITY: usize = 256;

const EVICTION_REASON: &str = "Cleanup before new connection";
const CLOSE_REASON: &str = "Normal closure";
const STALE_REASON: &str = "Superseded connection attempt";

/// Keeps exactly one realtime socket open, for the active conversation.
///
/// Connecting a conversation evicts every other one. Failed attempts are retried a bounded
/// number of times, an unexpected close of an established socket triggers one fresh
/// connection cycle, and inbound frames fan out to the conversation's listeners in
/// registration order.
///
/// All methods return immediately except [`ConnectionManager::wait_for_connection`].
/// Clones share state.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
///
/// use chat_realtime::auth::StaticToken;
/// use chat_realtime::network::AlwaysOnline;
/// use chat_realtime::types::{ChannelDescriptor, ConversationId, Frame};
/// use chat_realtime::ws::ConnectionManager;
/// use chat_realtime::ws::config::Config;
///
/// # async fn run() -> chat_realtime::Result<()> {
/// let manager = ConnectionManager::new(Config::from_env()?, StaticToken::new("t0k3n"), AlwaysOnline::default())?;
/// let chat = ConversationId(42);
///
/// manager.on_message(chat, Arc::new(|frame: &Frame| {
///     println!("{:?}", frame.as_text());
/// }));
/// manager.connect(chat, ChannelDescriptor::chat(chat));
///
/// if manager.wait_for_connection_default(chat).await {
///     manager.send(chat, &serde_json::json!({ "body": "hello" }));
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    tokens: Arc<dyn TokenProvider>,
    probe: Arc<dyn ConnectivityProbe>,
    transport: Arc<dyn SocketTransport>,
    registry: Mutex<Registry>,
    listeners: ListenerRegistry,
    status: DashMap<ConversationId, ConnectionStatus>,
    retries: DashMap<ConversationId, u32>,
    updates: broadcast::Sender<StatusUpdate>,
}

/// Everything that changes on a state transition, behind one lock.
struct Registry {
    records: HashMap<ConversationId, ConnectionRecord>,
    scheduler: RetryScheduler,
    next_cycle: u64,
}

impl Registry {
    /// The record for `id`, if it still belongs to connection cycle `cycle`.
    fn current(&mut self, id: ConversationId, cycle: u64) -> Option<&mut ConnectionRecord> {
        self.records
            .get_mut(&id)
            .filter(|record| record.cycle == cycle)
    }
}

struct ConnectionRecord {
    channel: ChannelDescriptor,
    socket: Option<Arc<dyn SocketHandle>>,
    status: ConnectionStatus,
    retry_count: u32,
    /// Set while a reconnect attempt is in flight; suppresses duplicate reconnect triggers
    reconnecting: bool,
    /// An attempt is in flight or a retry is pending
    attempting: bool,
    /// This cycle was started by `reconnect_disconnected`
    is_reconnect: bool,
    /// Bumped by every `connect`; late results of older cycles are discarded
    cycle: u64,
    pending_retry: Option<PendingRetry>,
}

impl ConnectionRecord {
    fn new(channel: ChannelDescriptor) -> Self {
        Self {
            channel,
            socket: None,
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            reconnecting: false,
            attempting: false,
            is_reconnect: false,
            cycle: 0,
            pending_retry: None,
        }
    }

    fn is_open(&self) -> bool {
        self.socket.as_ref().is_some_and(|socket| socket.is_open())
    }

    fn cancel_retry(&mut self) {
        if let Some(pending) = self.pending_retry.take() {
            pending.cancel();
        }
    }

    fn close_socket(&mut self, reason: &str) {
        if let Some(socket) = self.socket.take() {
            socket.close(NORMAL_CLOSURE, reason);
        }
    }
}

/// Why a single connection attempt did not produce a socket.
#[derive(Debug)]
enum AttemptError {
    /// The record was closed, evicted or restarted meanwhile
    Superseded,
    Offline,
    MissingToken,
    HandshakeTimeout,
    Failed(Error),
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => write!(f, "attempt superseded"),
            Self::Offline => write!(f, "network unavailable"),
            Self::MissingToken => write!(f, "no auth token available"),
            Self::HandshakeTimeout => write!(f, "{}", WsError::Timeout),
            Self::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl ConnectionManager {
    /// Creates a manager opening sockets with the adapter selected by `config.transport`.
    pub fn new<T, P>(config: Config, tokens: T, probe: P) -> Result<Self>
    where
        T: TokenProvider,
        P: ConnectivityProbe,
    {
        let transport = transport_for(config.transport)?;
        Self::with_parts(config, Arc::new(tokens), Arc::new(probe), transport)
    }

    /// Creates a manager over a caller-supplied transport.
    pub fn with_transport<T, P, S>(config: Config, tokens: T, probe: P, transport: S) -> Result<Self>
    where
        T: TokenProvider,
        P: ConnectivityProbe,
        S: SocketTransport,
    {
        Self::with_parts(
            config,
            Arc::new(tokens),
            Arc::new(probe),
            Arc::new(transport),
        )
    }

    fn with_parts(
        config: Config,
        tokens: Arc<dyn TokenProvider>,
        probe: Arc<dyn ConnectivityProbe>,
        transport: Arc<dyn SocketTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let (updates, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    records: HashMap::new(),
                    scheduler: RetryScheduler::new(config.retry),
                    next_cycle: 0,
                }),
                config,
                tokens,
                probe,
                transport,
                listeners: ListenerRegistry::default(),
                status: DashMap::new(),
                retries: DashMap::new(),
                updates,
            }),
        })
    }

    /// Connects `id`, evicting every other conversation first. Returns immediately.
    ///
    /// A second call while an attempt for `id` is in flight (or waiting to be retried)
    /// is ignored. A call while `id` is connected replaces its socket and keeps its
    /// listeners.
    pub fn connect(&self, id: ConversationId, channel: ChannelDescriptor) {
        self.inner.connect(id, channel, false);
    }

    /// Closes `id` with a normal closure and forgets it, listeners included.
    pub fn close(&self, id: ConversationId) {
        let mut registry = self.inner.registry();
        let removed = self.inner.teardown(&mut registry, id, CLOSE_REASON);
        #[cfg(feature = "tracing")]
        tracing::info!(%id, removed, "Close requested");
        #[cfg(not(feature = "tracing"))]
        let _ = removed;
    }

    pub fn close_all(&self) {
        let mut registry = self.inner.registry();
        let ids: Vec<_> = registry.records.keys().copied().collect();
        for id in ids {
            self.inner.teardown(&mut registry, id, CLOSE_REASON);
        }
    }

    #[must_use]
    pub fn is_connected(&self, id: ConversationId) -> bool {
        self.inner
            .registry()
            .records
            .get(&id)
            .is_some_and(ConnectionRecord::is_open)
    }

    /// Writes `message` if `id` is connected; otherwise drops it.
    pub fn send<M: Serialize>(&self, id: ConversationId, message: &M) {
        let socket = self
            .inner
            .registry()
            .records
            .get(&id)
            .filter(|record| record.is_open())
            .and_then(|record| record.socket.clone());

        let Some(socket) = socket else {
            #[cfg(feature = "tracing")]
            tracing::debug!(%id, "Not connected, dropping outgoing message");
            return;
        };

        let result = serde_json::to_value(message)
            .map_err(Error::from)
            .and_then(|value| socket.send(&value));
        if let Err(e) = result {
            #[cfg(feature = "tracing")]
            tracing::warn!(%id, error = %e, "Failed to send message");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Registers `listener` for inbound frames of `id`. Keep a clone to remove it later.
    pub fn on_message(&self, id: ConversationId, listener: Listener) {
        self.inner.listeners.add(id, listener);
    }

    pub fn remove_message_listener(&self, id: ConversationId, listener: &Listener) {
        self.inner.listeners.remove(id, listener);
    }

    #[must_use]
    pub fn listener_count(&self, id: ConversationId) -> usize {
        self.inner.listeners.count(id)
    }

    /// Polls until `id` is connected or `timeout` elapses.
    pub async fn wait_for_connection(&self, id: ConversationId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.is_connected(id) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.inner.config.poll_interval.min(deadline - now)).await;
        }
    }

    /// [`ConnectionManager::wait_for_connection`] with the configured default timeout.
    pub async fn wait_for_connection_default(&self, id: ConversationId) -> bool {
        self.wait_for_connection(id, self.inner.config.wait_timeout)
            .await
    }

    /// Status of every conversation seen so far.
    ///
    /// Entries are never removed: closed and evicted conversations stay in the map as
    /// `disconnected`, so the map grows with every distinct id this manager has connected.
    #[must_use]
    pub fn connection_status(&self) -> HashMap<ConversationId, ConnectionStatus> {
        self.inner
            .status
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    /// Retry count of every conversation seen so far. Like
    /// [`connection_status`](Self::connection_status), entries outlive `close`.
    #[must_use]
    pub fn retry_count(&self) -> HashMap<ConversationId, u32> {
        self.inner
            .retries
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect()
    }

    #[must_use]
    pub fn status(&self, id: ConversationId) -> Option<ConnectionStatus> {
        self.inner.status.get(&id).map(|status| *status)
    }

    #[must_use]
    pub fn retries(&self, id: ConversationId) -> Option<u32> {
        self.inner.retries.get(&id).map(|count| *count)
    }

    /// Subscribe to status changes.
    ///
    /// Every write of a conversation's status or retry count is published, in order.
    #[must_use]
    pub fn status_updates(&self) -> broadcast::Receiver<StatusUpdate> {
        self.inner.updates.subscribe()
    }

    /// Starts a new cycle for every conversation left `disconnected` and idle.
    ///
    /// Meant for "network restored" and "app returned to foreground" hooks.
    pub fn reconnect_disconnected(&self) {
        let stalled: Vec<_> = self
            .inner
            .registry()
            .records
            .iter()
            .filter(|(_, record)| {
                record.status == ConnectionStatus::Disconnected
                    && !record.attempting
                    && !record.reconnecting
                    && record.socket.is_none()
            })
            .map(|(id, record)| (*id, record.channel.clone()))
            .collect();

        for (id, channel) in stalled {
            #[cfg(feature = "tracing")]
            tracing::info!(%id, "Reconnecting stalled conversation");
            self.inner.connect(id, channel, true);
        }
    }

    /// Calls [`ConnectionManager::reconnect_disconnected`] on every offline to online
    /// transition of `network`. Abort the handle to stop watching.
    pub fn watch_connectivity(&self, mut network: watch::Receiver<NetworkState>) -> JoinHandle<()> {
        let manager = self.clone();

        tokio::spawn(async move {
            let mut was_online = network.borrow_and_update().is_online();
            while network.changed().await.is_ok() {
                let online = network.borrow_and_update().is_online();
                if online && !was_online {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Network restored");
                    manager.reconnect_disconnected();
                }
                was_online = online;
            }
        })
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("status", &self.connection_status())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, id: ConversationId, status: ConnectionStatus, retry_count: u32) {
        self.status.insert(id, status);
        self.retries.insert(id, retry_count);
        _ = self.updates.send(StatusUpdate {
            id,
            status,
            retry_count,
        });
    }

    /// Removes `id`: cancels its retry, closes its socket, drops its listeners.
    fn teardown(&self, registry: &mut Registry, id: ConversationId, reason: &str) -> bool {
        let Some(mut record) = registry.records.remove(&id) else {
            return false;
        };

        record.cancel_retry();
        record.close_socket(reason);
        self.listeners.remove_all(id);
        self.publish(id, ConnectionStatus::Disconnected, 0);
        true
    }

    fn connect(self: &Arc<Self>, id: ConversationId, channel: ChannelDescriptor, is_reconnect: bool) {
        let mut registry = self.registry();

        let others: Vec<_> = registry
            .records
            .keys()
            .copied()
            .filter(|other| *other != id)
            .collect();
        for other in others {
            #[cfg(feature = "tracing")]
            tracing::debug!(id = %other, "Evicting inactive conversation");
            self.teardown(&mut registry, other, EVICTION_REASON);
        }
        self.listeners.retain_only(id);

        if registry
            .records
            .get(&id)
            .is_some_and(|record| record.attempting)
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(%id, "Connection attempt already in progress");
            return;
        }

        registry.next_cycle += 1;
        let cycle = registry.next_cycle;
        let record = registry
            .records
            .entry(id)
            .or_insert_with(|| ConnectionRecord::new(channel.clone()));

        record.close_socket(EVICTION_REASON);
        record.cancel_retry();
        record.channel = channel;
        record.status = ConnectionStatus::Connecting;
        record.retry_count = 0;
        record.reconnecting = false;
        record.attempting = true;
        record.is_reconnect = is_reconnect;
        record.cycle = cycle;
        self.publish(id, ConnectionStatus::Connecting, 0);
        drop(registry);

        self.start_attempt(id, cycle);
    }

    fn start_attempt(self: &Arc<Self>, id: ConversationId, cycle: u64) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.attempt(id, cycle).await {
                Ok(()) | Err(AttemptError::Superseded) => {}
                Err(failure) => this.attempt_failed(id, cycle, &failure),
            }
        });
    }

    async fn attempt(self: &Arc<Self>, id: ConversationId, cycle: u64) -> std::result::Result<(), AttemptError> {
        {
            let mut registry = self.registry();
            let record = registry.current(id, cycle).ok_or(AttemptError::Superseded)?;
            if record.is_reconnect {
                record.reconnecting = true;
            }
        }

        if !self.probe.state().await.is_online() {
            let mut registry = self.registry();
            let record = registry.current(id, cycle).ok_or(AttemptError::Superseded)?;
            record.status = ConnectionStatus::Disconnected;
            record.reconnecting = false;
            self.publish(id, record.status, record.retry_count);
            return Err(AttemptError::Offline);
        }

        let Some(token) = self.tokens.token().await else {
            let mut registry = self.registry();
            let record = registry.current(id, cycle).ok_or(AttemptError::Superseded)?;
            record.status = ConnectionStatus::Error;
            self.publish(id, record.status, record.retry_count);
            return Err(AttemptError::MissingToken);
        };

        let endpoint = endpoint::build(&self.config.endpoint, &token, self.config.platform)
            .map_err(AttemptError::Failed)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%id, "Opening socket");
        let Socket { handle, events } = match timeout(
            self.config.handshake_timeout,
            self.transport.open(&endpoint),
        )
        .await
        {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(AttemptError::Failed(e)),
            Err(_elapsed) => return Err(AttemptError::HandshakeTimeout),
        };

        {
            let mut registry = self.registry();
            let Some(record) = registry.current(id, cycle) else {
                handle.close(NORMAL_CLOSURE, STALE_REASON);
                return Err(AttemptError::Superseded);
            };

            if let Err(e) = handle.subscribe(&record.channel) {
                handle.close(NORMAL_CLOSURE, CLOSE_REASON);
                return Err(AttemptError::Failed(e));
            }

            record.socket = Some(Arc::clone(&handle));
            record.status = ConnectionStatus::Connected;
            record.retry_count = 0;
            record.attempting = false;
            record.reconnecting = false;
            record.cancel_retry();
            self.publish(id, ConnectionStatus::Connected, 0);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(%id, "Connected");
        self.pump(id, cycle, events);
        Ok(())
    }

    fn attempt_failed(self: &Arc<Self>, id: ConversationId, cycle: u64, failure: &AttemptError) {
        #[cfg(feature = "tracing")]
        tracing::warn!(%id, error = %failure, "Connection attempt failed");

        let mut registry = self.registry();
        let Registry {
            records, scheduler, ..
        } = &mut *registry;
        let Some(record) = records.get_mut(&id).filter(|record| record.cycle == cycle) else {
            return;
        };

        match scheduler.decide(record.retry_count) {
            RetryDecision::Retry { attempt, delay } => {
                #[cfg(feature = "tracing")]
                tracing::info!(%id, attempt, ?delay, "Scheduling retry");
                record.retry_count = attempt;
                self.publish(id, record.status, attempt);

                let this = Arc::clone(self);
                record.pending_retry = Some(scheduler.schedule(attempt, delay, move || {
                    this.retry_fired(id, cycle);
                }));
            }
            RetryDecision::Exhausted => {
                record.attempting = false;
                record.reconnecting = false;
                record.status = if matches!(failure, AttemptError::Offline) {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Error
                };
                #[cfg(feature = "tracing")]
                tracing::error!(%id, status = %record.status, "Retries exhausted");
                self.publish(id, record.status, record.retry_count);
            }
        }
    }

    fn retry_fired(self: &Arc<Self>, id: ConversationId, cycle: u64) {
        {
            let mut registry = self.registry();
            let Some(record) = registry.current(id, cycle) else {
                return;
            };
            let Some(pending) = record.pending_retry.take() else {
                return;
            };
            #[cfg(feature = "tracing")]
            tracing::info!(%id, attempt = pending.attempt, "Retrying connection");
            #[cfg(not(feature = "tracing"))]
            let _ = &pending;
        }

        self.start_attempt(id, cycle);
    }

    /// Drains socket events for one connection cycle.
    fn pump(self: &Arc<Self>, id: ConversationId, cycle: u64, mut events: mpsc::UnboundedReceiver<SocketEvent>) {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    SocketEvent::Message(frame) => this.dispatch(id, cycle, &frame),
                    SocketEvent::Error(error) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(%id, %error, "Socket error");
                        #[cfg(not(feature = "tracing"))]
                        let _ = &error;
                    }
                    SocketEvent::Rejected(reason) => this.rejected(id, cycle, &reason),
                    SocketEvent::Closed { code, reason } => {
                        this.closed(id, cycle, code, &reason);
                        return;
                    }
                }
            }
            this.closed(id, cycle, None, "event stream ended");
        });
    }

    fn dispatch(&self, id: ConversationId, cycle: u64, frame: &Frame) {
        let live = self
            .registry()
            .current(id, cycle)
            .is_some_and(|record| record.socket.is_some());
        if !live {
            return;
        }

        for listener in self.listeners.snapshot(id) {
            listener(frame);
        }
    }

    fn closed(self: &Arc<Self>, id: ConversationId, cycle: u64, code: Option<u16>, reason: &str) {
        let heal = {
            let mut registry = self.registry();
            let Some(record) = registry.current(id, cycle) else {
                return;
            };
            if record.socket.take().is_none() {
                return;
            }

            #[cfg(feature = "tracing")]
            tracing::info!(%id, ?code, %reason, "Socket closed");
            #[cfg(not(feature = "tracing"))]
            let _ = (&code, &reason);

            record.status = ConnectionStatus::Disconnected;
            self.publish(id, record.status, record.retry_count);

            let heal = !record.reconnecting;
            record.reconnecting = false;
            heal.then(|| record.channel.clone())
        };

        if let Some(channel) = heal {
            #[cfg(feature = "tracing")]
            tracing::info!(%id, "Attempting to reconnect");
            self.connect(id, channel, false);
        }
    }

    /// The server refused the subscription. Terminal for this cycle: the socket is detached
    /// so the close that follows does not self-heal into another rejection.
    fn rejected(&self, id: ConversationId, cycle: u64, reason: &str) {
        let mut registry = self.registry();
        let Some(record) = registry.current(id, cycle) else {
            return;
        };
        let Some(socket) = record.socket.take() else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::error!(%id, %reason, "Subscription rejected");
        socket.close(NORMAL_CLOSURE, reason);

        record.cancel_retry();
        record.attempting = false;
        record.reconnecting = false;
        record.retry_count += 1;
        record.status = ConnectionStatus::Error;
        self.publish(id, record.status, record.retry_count);
    }
}

/// Builds the adapter selected by `kind`, if it was compiled in.
fn transport_for(kind: TransportKind) -> Result<Arc<dyn SocketTransport>> {
    match kind {
        #[cfg(feature = "raw")]
        TransportKind::Raw => Ok(Arc::new(super::raw::RawTransport)),
        #[cfg(feature = "cable")]
        TransportKind::Cable => Ok(Arc::new(super::cable::CableTransport::default())),
        #[cfg(not(feature = "raw"))]
        TransportKind::Raw => Err(WsError::TransportUnavailable("raw").into()),
        #[cfg(not(feature = "cable"))]
        TransportKind::Cable => Err(WsError::TransportUnavailable("cable").into()),
    }
}
