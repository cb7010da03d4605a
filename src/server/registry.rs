//! Live connections, keyed by connection id.
//!
//! The registry is the only shared mutable state on the server. Every insert,
//! remove and lookup goes through one `RwLock`, so accept, disconnect and
//! broadcast cannot interleave half-way.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::protocol::{MessageEnvelope, TransportKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub connection_id: String,
    pub remote_address: Option<SocketAddr>,
    pub transport: TransportKind,
    pub authenticated: bool,
    pub identity: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Frames queued for a connection's writer.
#[derive(Debug, Clone)]
pub enum Outbound {
    Frame(Arc<String>),
    Close,
}

struct SessionEntry {
    handle: SessionHandle,
    tx: mpsc::UnboundedSender<Outbound>,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly accepted connection and returns its handle plus the
    /// receiving end of its outbound queue.
    pub async fn register(
        &self,
        transport: TransportKind,
        remote_address: Option<SocketAddr>,
        authenticated: bool,
        identity: Option<String>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            connection_id: format!("{}-{}", transport.name(), uuid::Uuid::new_v4().simple()),
            remote_address,
            transport,
            authenticated,
            identity,
            connected_at: Utc::now(),
        };

        self.sessions.write().await.insert(
            handle.connection_id.clone(),
            SessionEntry {
                handle: handle.clone(),
                tx,
            },
        );
        debug!(conn_id = %handle.connection_id, %transport, "session registered");
        (handle, rx)
    }

    pub async fn remove(&self, connection_id: &str) -> Option<SessionHandle> {
        let removed = self.sessions.write().await.remove(connection_id);
        if removed.is_some() {
            debug!(conn_id = %connection_id, "session removed");
        }
        removed.map(|entry| entry.handle)
    }

    pub async fn get(&self, connection_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.handle.clone())
    }

    pub async fn mark_authenticated(
        &self,
        connection_id: &str,
        identity: Option<String>,
    ) -> Option<SessionHandle> {
        let mut sessions = self.sessions.write().await;
        let entry = sessions.get_mut(connection_id)?;
        entry.handle.authenticated = true;
        entry.handle.identity = identity;
        Some(entry.handle.clone())
    }

    /// Queues `envelope` for one connection. Unknown ids are a logged no-op.
    pub async fn send_to(&self, connection_id: &str, envelope: &MessageEnvelope) -> bool {
        let text = match envelope.to_json() {
            Ok(text) => Arc::new(text),
            Err(error) => {
                warn!(error = %error, "failed to serialize envelope");
                return false;
            }
        };

        let sessions = self.sessions.read().await;
        match sessions.get(connection_id) {
            Some(entry) => entry.tx.send(Outbound::Frame(text)).is_ok(),
            None => {
                debug!(conn_id = %connection_id, kind = %envelope.kind, "send to unknown connection dropped");
                false
            }
        }
    }

    /// Queues `envelope` for every authenticated connection; returns the
    /// number of recipients.
    pub async fn broadcast(&self, envelope: &MessageEnvelope) -> usize {
        let text = match envelope.to_json() {
            Ok(text) => Arc::new(text),
            Err(error) => {
                warn!(error = %error, "failed to serialize broadcast");
                return 0;
            }
        };

        let sessions = self.sessions.read().await;
        let mut recipients = 0;
        for entry in sessions.values().filter(|entry| entry.handle.authenticated) {
            if entry.tx.send(Outbound::Frame(Arc::clone(&text))).is_ok() {
                recipients += 1;
            }
        }
        debug!(kind = %envelope.kind, recipients, "broadcast");
        recipients
    }

    /// Removes the connection and tells its writer to close the transport.
    pub async fn close(&self, connection_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(connection_id);
        match removed {
            Some(entry) => {
                let _ = entry.tx.send(Outbound::Close);
                debug!(conn_id = %connection_id, "session closed by server");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;
    use serde_json::json;

    fn push() -> MessageEnvelope {
        MessageEnvelope::new(MessageType::Custom("files/changed".to_string()), json!({}))
    }

    fn frame_text(outbound: Outbound) -> String {
        match outbound {
            Outbound::Frame(text) => text.to_string(),
            Outbound::Close => panic!("expected frame, got close"),
        }
    }

    #[tokio::test]
    async fn register_and_remove() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = registry
            .register(TransportKind::WebSocket, None, false, None)
            .await;
        assert_eq!(registry.len().await, 1);
        assert!(handle.connection_id.starts_with("websocket-"));

        let removed = registry.remove(&handle.connection_id).await.expect("removed");
        assert_eq!(removed.connection_id, handle.connection_id);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn send_to_reaches_only_target() {
        let registry = SessionRegistry::new();
        let (a, mut rx_a) = registry.register(TransportKind::WebSocket, None, true, None).await;
        let (_b, mut rx_b) = registry.register(TransportKind::Polling, None, true, None).await;

        assert!(registry.send_to(&a.connection_id, &push()).await);

        let text = frame_text(rx_a.try_recv().expect("frame for a"));
        assert!(text.contains("files/changed"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_to_disconnected_is_noop() {
        let registry = SessionRegistry::new();
        let (handle, rx) = registry.register(TransportKind::WebSocket, None, true, None).await;
        registry.remove(&handle.connection_id).await;
        drop(rx);

        assert!(!registry.send_to(&handle.connection_id, &push()).await);
        assert!(!registry.send_to("never-existed", &push()).await);
    }

    #[tokio::test]
    async fn broadcast_skips_unauthenticated() {
        let registry = SessionRegistry::new();
        let (_a, mut rx_a) = registry.register(TransportKind::WebSocket, None, true, None).await;
        let (b, mut rx_b) = registry.register(TransportKind::WebSocket, None, false, None).await;

        assert_eq!(registry.broadcast(&push()).await, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());

        registry
            .mark_authenticated(&b.connection_id, Some("token".to_string()))
            .await
            .expect("still registered");
        assert_eq!(registry.broadcast(&push()).await, 2);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_queues_close_and_unregisters() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = registry.register(TransportKind::WebSocket, None, true, None).await;

        assert!(registry.close(&handle.connection_id).await);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(registry.get(&handle.connection_id).await.is_none());
        assert!(!registry.close(&handle.connection_id).await);
    }
}
