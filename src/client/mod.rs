//! Client side of the bridge: one logical connection to one server.
//!
//! `ConnectionSession` is a cheap handle (`Clone` over an `Arc`); every clone
//! drives the same session. State only changes inside this module; callers
//! use `connect`, `disconnect`, `close`, `emit` and `request`.
//!
//! Transport choice: an attempt opens one transport at a time, starting with
//! the one that last worked (WebSocket until anything has). Long-polling is
//! only opened when WebSocket cannot be established, and a transport that
//! failed is never tried ahead of the preferred one.

pub mod transport;

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use self::transport::{
    Connector, Endpoint, Link, LinkEvent, PollingConnector, TaskGuard, WebSocketConnector,
};
use crate::config::ClientConfig;
use crate::discovery::Scanner;
use crate::error::{BridgeError, ConnectError};
use crate::protocol::{MessageEnvelope, MessageType, TransportKind, Welcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: ConnectionState,
    pub transport: Option<TransportKind>,
    pub connection_id: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            transport: None,
            connection_id: None,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// Which inbound envelopes a handler receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    Type(MessageType),
    Any,
}

pub type EnvelopeHandler = Arc<dyn Fn(&MessageEnvelope) -> Result<(), BridgeError> + Send + Sync>;

/// Returned by `on`; pass to `off` to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type AttemptFuture = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

struct ActiveLink {
    id: u64,
    kind: TransportKind,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
    _guard: TaskGuard,
}

enum AttemptError {
    Failed(String),
    Auth(String),
}

struct Inner {
    config: ClientConfig,
    endpoint: Endpoint,
    connectors: Vec<Arc<dyn Connector>>,
    status: watch::Sender<SessionStatus>,
    preferred: Mutex<TransportKind>,
    epoch: AtomicU64,
    next_link_id: AtomicU64,
    next_handler_id: AtomicU64,
    inflight: Mutex<Option<AttemptFuture>>,
    link: Mutex<Option<ActiveLink>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    handlers: RwLock<Vec<(HandlerId, Subscription, EnvelopeHandler)>>,
    pending: Mutex<HashMap<String, oneshot::Sender<MessageEnvelope>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone)]
pub struct ConnectionSession {
    inner: Arc<Inner>,
}

impl ConnectionSession {
    /// Session using the transports listed in `config.transports`.
    pub fn new(config: ClientConfig, endpoint: Endpoint) -> Self {
        let connectors = config
            .transports
            .iter()
            .map(|kind| -> Arc<dyn Connector> {
                match kind {
                    TransportKind::WebSocket => Arc::new(WebSocketConnector),
                    TransportKind::Polling => Arc::new(PollingConnector::new()),
                }
            })
            .collect();
        Self::with_connectors(config, endpoint, connectors)
    }

    pub fn with_connectors(
        config: ClientConfig,
        endpoint: Endpoint,
        connectors: Vec<Arc<dyn Connector>>,
    ) -> Self {
        let endpoint = endpoint.with_token(config.auth_token.clone());
        let (status, _) = watch::channel(SessionStatus::default());
        Self {
            inner: Arc::new(Inner {
                config,
                endpoint,
                connectors,
                status,
                preferred: Mutex::new(TransportKind::WebSocket),
                epoch: AtomicU64::new(0),
                next_link_id: AtomicU64::new(1),
                next_handler_id: AtomicU64::new(1),
                inflight: Mutex::new(None),
                link: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Finds a running bridge with `quick_scan` and builds a session for it.
    pub async fn discover(config: ClientConfig) -> Option<Self> {
        let scanner = Scanner::new(config.scan.clone());
        let hit = scanner.quick_scan(&config.scan_host).await?;
        info!(port = hit.port, version = ?hit.service_version, "discovered bridge");
        let endpoint = Endpoint::new(hit.host, hit.port);
        Some(Self::new(config, endpoint))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    pub fn retry_count(&self) -> u32 {
        self.inner.status.borrow().retry_count
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.status.borrow().last_error.clone()
    }

    /// Active transport name, for diagnostics.
    pub fn transport_name(&self) -> Option<&'static str> {
        self.inner.status.borrow().transport.map(TransportKind::name)
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn on<F>(&self, subscription: Subscription, handler: F) -> HandlerId
    where
        F: Fn(&MessageEnvelope) -> Result<(), BridgeError> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        let handler: EnvelopeHandler = Arc::new(handler);
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, subscription, handler));
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(handler_id, _, _)| *handler_id != id);
        handlers.len() != before
    }

    /// Connects, retrying up to `max_retries` attempts. Concurrent calls share
    /// one attempt and all see its result.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        match self.state() {
            ConnectionState::Closed => return Err(ConnectError::Closed),
            ConnectionState::Connected => return Ok(()),
            _ => {}
        }
        self.attempt(ConnectionState::Connecting).await
    }

    fn attempt(&self, mode: ConnectionState) -> AttemptFuture {
        let mut inflight = lock(&self.inner.inflight);
        if let Some(existing) = inflight.as_ref() {
            return existing.clone();
        }
        let session = self.clone();
        let attempt = async move { session.establish(mode).await }
            .boxed()
            .shared();
        *inflight = Some(attempt.clone());
        attempt
    }

    async fn establish(self, mode: ConnectionState) -> Result<(), ConnectError> {
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let max_attempts = self.inner.config.max_retries.max(1);
        let timeout = self.inner.config.connect_timeout;
        self.update_status(|status| {
            status.state = mode;
            status.retry_count = 0;
        });

        let result = loop {
            let deadline = Instant::now() + timeout;
            let outcome = tokio::time::timeout_at(deadline, self.open_primary()).await;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                break Err(ConnectError::Aborted);
            }

            let message = match outcome {
                Ok(Ok(opened)) => {
                    if self.install(opened, epoch) {
                        break Ok(());
                    }
                    break Err(ConnectError::Aborted);
                }
                Ok(Err(AttemptError::Auth(message))) => {
                    break Err(ConnectError::AuthRejected(message));
                }
                Ok(Err(AttemptError::Failed(message))) => message,
                Err(_) => format!("connect attempt timed out after {timeout:?}"),
            };

            let mut retry_count = 0;
            self.update_status(|status| {
                status.retry_count += 1;
                status.last_error = Some(message.clone());
                retry_count = status.retry_count;
            });
            warn!(attempt = retry_count, max_attempts, error = %message, "connect attempt failed");

            if retry_count >= max_attempts {
                break Err(ConnectError::RetriesExhausted {
                    attempts: retry_count,
                    last_error: message,
                });
            }
            // Fixed cadence: the next attempt starts once this one's full
            // timeout has elapsed.
            tokio::time::sleep_until(deadline).await;
            if self.inner.epoch.load(Ordering::SeqCst) != epoch {
                break Err(ConnectError::Aborted);
            }
        };

        self.finish_attempt(epoch, &result);
        result
    }

    /// Publishes the final status and frees the single-flight slot. Both
    /// happen under the slot lock so a new attempt can only start once the
    /// status no longer reflects this one.
    fn finish_attempt(&self, epoch: u64, result: &Result<(), ConnectError>) {
        let mut inflight = lock(&self.inner.inflight);
        // `disconnect` already cleared the slot and the status; a newer
        // attempt may own the slot now.
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if let Err(error) = result {
            if *error != ConnectError::Aborted {
                self.update_status(|status| {
                    status.state = ConnectionState::Disconnected;
                    status.transport = None;
                    status.last_error = Some(error.to_string());
                });
            }
        }
        *inflight = None;
    }

    fn connector(&self, kind: TransportKind) -> Option<Arc<dyn Connector>> {
        self.inner
            .connectors
            .iter()
            .find(|connector| connector.kind() == kind)
            .cloned()
    }

    /// Connectors in the order this attempt should try them: the last
    /// transport that worked, then the other.
    fn transport_order(&self) -> Vec<Arc<dyn Connector>> {
        let preferred = *lock(&self.inner.preferred);
        let fallback = match preferred {
            TransportKind::WebSocket => TransportKind::Polling,
            TransportKind::Polling => TransportKind::WebSocket,
        };
        [preferred, fallback]
            .into_iter()
            .filter_map(|kind| self.connector(kind))
            .collect()
    }

    async fn open_primary(&self) -> Result<(Link, Welcome), AttemptError> {
        let mut last_error = None;
        for connector in self.transport_order() {
            let kind = connector.kind();
            match connector.open(&self.inner.endpoint).await {
                Ok(link) => match self.handshake(link).await {
                    Ok(opened) => {
                        *lock(&self.inner.preferred) = kind;
                        return Ok(opened);
                    }
                    Err(AttemptError::Auth(message)) => return Err(AttemptError::Auth(message)),
                    Err(AttemptError::Failed(message)) => {
                        debug!(transport = %kind, error = %message, "handshake failed");
                        last_error = Some(message);
                    }
                },
                Err(error) => {
                    debug!(transport = %kind, error = %error, "transport failed to open");
                    last_error = Some(error.to_string());
                }
            }
        }
        Err(AttemptError::Failed(
            last_error.unwrap_or_else(|| "no transports configured".to_string()),
        ))
    }

    /// Waits for the welcome push and runs the auth handshake if required.
    async fn handshake(&self, mut link: Link) -> Result<(Link, Welcome), AttemptError> {
        let welcome = loop {
            match link.inbound.recv().await {
                Some(LinkEvent::Frame(text)) => match MessageEnvelope::from_json(&text) {
                    Ok(envelope) if envelope.kind == MessageType::Welcome => {
                        break serde_json::from_value::<Welcome>(envelope.payload).map_err(
                            |error| AttemptError::Failed(format!("invalid welcome: {error}")),
                        )?;
                    }
                    _ => debug!("frame before welcome ignored"),
                },
                Some(LinkEvent::Closed(reason)) => {
                    return Err(AttemptError::Failed(
                        reason.unwrap_or_else(|| "closed before welcome".to_string()),
                    ));
                }
                None => return Err(AttemptError::Failed("closed before welcome".to_string())),
            }
        };

        if !welcome.auth_required {
            return Ok((link, welcome));
        }

        let Some(token) = self.inner.endpoint.token.clone() else {
            return Err(AttemptError::Auth(
                "server requires authentication but no token is configured".to_string(),
            ));
        };

        let auth = MessageEnvelope::new(MessageType::Auth, json!({ "token": token }));
        let text = auth
            .to_json()
            .map_err(|error| AttemptError::Failed(error.to_string()))?;
        link.outbound
            .send(text)
            .map_err(|_| AttemptError::Failed("transport closed during auth".to_string()))?;

        loop {
            match link.inbound.recv().await {
                Some(LinkEvent::Frame(text)) => match MessageEnvelope::from_json(&text) {
                    Ok(reply) if reply.id == auth.id => {
                        if reply.is_error() {
                            return Err(AttemptError::Auth(
                                BridgeError::from_payload(&reply.payload).to_string(),
                            ));
                        }
                        return Ok((link, welcome));
                    }
                    _ => debug!("frame during auth ignored"),
                },
                Some(LinkEvent::Closed(reason)) => {
                    return Err(AttemptError::Auth(
                        reason.unwrap_or_else(|| "closed during auth".to_string()),
                    ));
                }
                None => return Err(AttemptError::Auth("closed during auth".to_string())),
            }
        }
    }

    /// Makes `link` the active transport unless a disconnect happened since
    /// the attempt began.
    fn install(&self, (link, welcome): (Link, Welcome), epoch: u64) -> bool {
        let Link {
            kind,
            outbound,
            mut inbound,
            guard,
        } = link;

        let mut active = lock(&self.inner.link);
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }

        let link_id = self.inner.next_link_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let reader = tokio::spawn(async move {
            let mut reason = None;
            while let Some(event) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match event {
                    LinkEvent::Frame(text) => inner.deliver(&text),
                    LinkEvent::Closed(closed_reason) => {
                        reason = closed_reason;
                        break;
                    }
                }
            }
            if let Some(inner) = weak.upgrade() {
                ConnectionSession { inner }.on_transport_closed(link_id, reason);
            }
        });

        if let Some(previous) = active.replace(ActiveLink {
            id: link_id,
            kind,
            outbound,
            reader,
            _guard: guard,
        }) {
            previous.reader.abort();
        }
        drop(active);

        self.update_status(|status| {
            status.state = ConnectionState::Connected;
            status.transport = Some(kind);
            status.connection_id = Some(welcome.connection_id.clone());
            status.retry_count = 0;
            status.last_error = None;
        });
        info!(transport = %kind, conn_id = %welcome.connection_id, "connected");
        self.inner.notify_status("connected", None);
        true
    }

    fn on_transport_closed(&self, link_id: u64, reason: Option<String>) {
        {
            let mut active = lock(&self.inner.link);
            if active.as_ref().map(|link| link.id) != Some(link_id) {
                return;
            }
            *active = None;
        }
        self.inner.fail_pending();

        let reconnect = self.inner.config.auto_reconnect;
        let reason = reason.unwrap_or_else(|| "transport closed".to_string());
        warn!(error = %reason, reconnect, "transport disconnected");
        self.update_status(|status| {
            status.state = if reconnect {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Disconnected
            };
            status.transport = None;
            status.connection_id = None;
            status.last_error = Some(reason.clone());
        });
        self.inner.notify_status("disconnected", Some(&reason));

        if reconnect {
            let session = self.clone();
            let task = tokio::spawn(async move {
                if let Err(error) = session.attempt(ConnectionState::Reconnecting).await {
                    warn!(error = %error, "reconnect gave up");
                }
            });
            if let Some(previous) = lock(&self.inner.reconnect_task).replace(task) {
                previous.abort();
            }
        }
    }

    /// Queues `envelope` on the active transport. Never buffers: without a
    /// connection the envelope is dropped and `NotConnected` returned.
    pub fn emit(&self, envelope: &MessageEnvelope) -> Result<(), BridgeError> {
        let active = lock(&self.inner.link);
        let Some(link) = active.as_ref() else {
            warn!(kind = %envelope.kind, "emit while not connected, dropped");
            return Err(BridgeError::NotConnected);
        };
        let text = envelope.to_json()?;
        link.outbound.send(text).map_err(|_| {
            warn!(kind = %envelope.kind, transport = %link.kind, "emit on closed transport, dropped");
            BridgeError::NotConnected
        })
    }

    /// Sends a request and waits for the envelope carrying the same id.
    pub async fn request(
        &self,
        kind: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> Result<MessageEnvelope, BridgeError> {
        let envelope = MessageEnvelope::new(kind, payload);
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(envelope.id.clone(), tx);

        if let Err(error) = self.emit(&envelope) {
            lock(&self.inner.pending).remove(&envelope.id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.is_error() => Err(BridgeError::from_payload(&reply.payload)),
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BridgeError::NotConnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&envelope.id);
                Err(BridgeError::Timeout(timeout))
            }
        }
    }

    /// Tears down the transport and any background reconnect. Safe to call
    /// any number of times.
    pub fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.inflight).take();

        if let Some(task) = lock(&self.inner.reconnect_task).take() {
            task.abort();
        }
        let previous = lock(&self.inner.link).take();
        let was_connected = previous.is_some();
        if let Some(link) = previous {
            link.reader.abort();
        }
        self.inner.fail_pending();

        self.update_status(|status| {
            if status.state != ConnectionState::Closed {
                status.state = ConnectionState::Disconnected;
            }
            status.transport = None;
            status.connection_id = None;
            status.retry_count = 0;
        });

        if was_connected {
            info!("disconnected");
            self.inner.notify_status("disconnected", None);
        }
    }

    /// Disconnects for good; later `connect` calls fail with `Closed`.
    pub fn close(&self) {
        self.disconnect();
        self.update_status(|status| status.state = ConnectionState::Closed);
    }

    fn update_status(&self, apply: impl FnOnce(&mut SessionStatus)) {
        self.inner.status.send_modify(apply);
    }
}

impl Inner {
    fn deliver(&self, text: &str) {
        let envelope = match MessageEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(error = %error, "invalid envelope from server");
                return;
            }
        };

        if let Some(waiter) = lock(&self.pending).remove(&envelope.id) {
            let _ = waiter.send(envelope.clone());
        }
        self.dispatch(&envelope);
    }

    /// Runs handlers for the envelope's type, then wildcard handlers. Each
    /// handler is isolated: errors and panics are logged and skipped.
    fn dispatch(&self, envelope: &MessageEnvelope) {
        let (typed, wildcard): (Vec<_>, Vec<_>) = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            let typed = handlers
                .iter()
                .filter(|(_, sub, _)| *sub == Subscription::Type(envelope.kind.clone()))
                .map(|(id, _, handler)| (*id, handler.clone()))
                .collect();
            let wildcard = handlers
                .iter()
                .filter(|(_, sub, _)| *sub == Subscription::Any)
                .map(|(id, _, handler)| (*id, handler.clone()))
                .collect();
            (typed, wildcard)
        };

        for (id, handler) in typed.into_iter().chain(wildcard) {
            match catch_unwind(AssertUnwindSafe(|| handler(envelope))) {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    warn!(handler = id.0, kind = %envelope.kind, error = %error, "handler failed");
                }
                Err(_) => {
                    warn!(handler = id.0, kind = %envelope.kind, "handler panicked");
                }
            }
        }
    }

    fn notify_status(&self, status: &str, reason: Option<&str>) {
        let envelope = MessageEnvelope::new(
            MessageType::ConnectionStatus,
            json!({
                "status": status,
                "reason": reason,
            }),
        );
        self.dispatch(&envelope);
    }

    fn fail_pending(&self) {
        // Dropping the senders wakes every waiter with `NotConnected`.
        lock(&self.pending).clear();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.reconnect_task).take() {
            task.abort();
        }
        if let Some(link) = lock(&self.link).take() {
            link.reader.abort();
        }
    }
}
