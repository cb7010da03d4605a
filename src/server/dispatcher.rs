//! Routes inbound envelopes to typed handlers and sends the replies.
//!
//! Handlers are looked up by `MessageType`. The dispatcher owns the auth gate:
//! until a connection is authenticated only `auth` is accepted.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::auth::{Authenticator, Credentials};
use super::registry::{SessionHandle, SessionRegistry};
use crate::error::BridgeError;
use crate::protocol::{MessageEnvelope, MessageType};

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, session: &SessionHandle, payload: Value) -> Result<Value, BridgeError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(SessionHandle, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, BridgeError>> + Send,
{
    async fn handle(&self, session: &SessionHandle, payload: Value) -> Result<Value, BridgeError> {
        (self.0)(session.clone(), payload).await
    }
}

/// Wraps an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(SessionHandle, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, BridgeError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Echoes the payload back.
pub struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, _session: &SessionHandle, payload: Value) -> Result<Value, BridgeError> {
        Ok(payload)
    }
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    authenticator: Arc<dyn Authenticator>,
    handlers: RwLock<HashMap<MessageType, Arc<dyn MessageHandler>>>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SessionRegistry>, authenticator: Arc<dyn Authenticator>) -> Self {
        let mut handlers: HashMap<MessageType, Arc<dyn MessageHandler>> = HashMap::new();
        handlers.insert(MessageType::Ping, Arc::new(PingHandler));
        Self {
            registry,
            authenticator,
            handlers: RwLock::new(handlers),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn authenticator(&self) -> &Arc<dyn Authenticator> {
        &self.authenticator
    }

    /// Registers the handler for `kind`. Protocol-owned types and types that
    /// already have a handler are refused.
    pub fn register(
        &self,
        kind: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BridgeError> {
        if kind.is_reserved() {
            return Err(BridgeError::InvalidParams(format!(
                "message type {kind} is reserved"
            )));
        }

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(&kind) {
            return Err(BridgeError::InvalidParams(format!(
                "handler for {kind} already registered"
            )));
        }
        handlers.insert(kind, handler);
        Ok(())
    }

    /// Replaces any existing handler for `kind`.
    pub fn replace(
        &self,
        kind: MessageType,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BridgeError> {
        if kind.is_reserved() {
            return Err(BridgeError::InvalidParams(format!(
                "message type {kind} is reserved"
            )));
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind, handler);
        Ok(())
    }

    fn handler_for(&self, kind: &MessageType) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(kind)
            .cloned()
    }

    /// Handles one inbound envelope for `session` and sends the reply, if
    /// any, through the registry. The reply is also returned.
    pub async fn handle_inbound(
        &self,
        session: &SessionHandle,
        envelope: MessageEnvelope,
    ) -> Option<MessageEnvelope> {
        // The caller's handle may predate an auth handshake; the registry is
        // authoritative.
        let Some(current) = self.registry.get(&session.connection_id).await else {
            debug!(conn_id = %session.connection_id, "inbound for closed connection dropped");
            return None;
        };

        if envelope.kind == MessageType::Auth {
            return Some(self.handle_auth(&current, &envelope).await);
        }

        if !current.authenticated {
            let reply = envelope.error_reply(&BridgeError::Unauthenticated);
            self.registry.send_to(&current.connection_id, &reply).await;
            return Some(reply);
        }

        let reply = match self.handler_for(&envelope.kind) {
            Some(handler) => self.run_handler(&current, handler, &envelope).await,
            None => {
                debug!(conn_id = %current.connection_id, kind = %envelope.kind, "unknown message type");
                envelope.error_reply(&BridgeError::UnknownType(envelope.kind.to_string()))
            }
        };

        self.registry.send_to(&current.connection_id, &reply).await;
        Some(reply)
    }

    async fn run_handler(
        &self,
        session: &SessionHandle,
        handler: Arc<dyn MessageHandler>,
        envelope: &MessageEnvelope,
    ) -> MessageEnvelope {
        let outcome = AssertUnwindSafe(handler.handle(session, envelope.payload.clone()))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(payload)) => envelope.reply(payload),
            Ok(Err(error)) => {
                warn!(conn_id = %session.connection_id, kind = %envelope.kind, error = %error, "handler failed");
                envelope.error_reply(&error)
            }
            Err(_) => {
                warn!(conn_id = %session.connection_id, kind = %envelope.kind, "handler panicked");
                envelope.error_reply(&BridgeError::Handler(format!(
                    "{} handler panicked",
                    envelope.kind
                )))
            }
        }
    }

    async fn handle_auth(
        &self,
        session: &SessionHandle,
        envelope: &MessageEnvelope,
    ) -> MessageEnvelope {
        if session.authenticated {
            let reply = envelope.reply(json!({
                "authenticated": true,
                "identity": session.identity,
            }));
            self.registry.send_to(&session.connection_id, &reply).await;
            return reply;
        }

        let credentials: Credentials = match serde_json::from_value(envelope.payload.clone()) {
            Ok(credentials) => credentials,
            Err(error) => {
                let reply = envelope.error_reply(&BridgeError::InvalidParams(error.to_string()));
                self.registry.send_to(&session.connection_id, &reply).await;
                return reply;
            }
        };

        let outcome = self.authenticator.authenticate(&credentials).await;
        if !outcome.authenticated {
            info!(conn_id = %session.connection_id, "auth handshake rejected, closing");
            let reply = envelope.error_reply(&BridgeError::AuthFailed(
                "invalid credentials".to_string(),
            ));
            self.registry.send_to(&session.connection_id, &reply).await;
            self.registry.close(&session.connection_id).await;
            return reply;
        }

        self.registry
            .mark_authenticated(&session.connection_id, outcome.identity.clone())
            .await;
        info!(conn_id = %session.connection_id, identity = ?outcome.identity, "connection authenticated");

        let reply = envelope.reply(json!({
            "authenticated": true,
            "identity": outcome.identity,
        }));
        self.registry.send_to(&session.connection_id, &reply).await;
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::protocol::TransportKind;
    use crate::server::auth::TokenAuthenticator;
    use crate::server::registry::Outbound;
    use tokio::sync::mpsc;

    struct PanickingHandler;

    #[async_trait]
    impl MessageHandler for PanickingHandler {
        async fn handle(&self, _: &SessionHandle, _: Value) -> Result<Value, BridgeError> {
            panic!("handler blew up");
        }
    }

    fn dispatcher(token: Option<&str>) -> Dispatcher {
        Dispatcher::new(
            Arc::new(SessionRegistry::new()),
            Arc::new(TokenAuthenticator::new(token.map(str::to_string))),
        )
    }

    async fn connect(
        dispatcher: &Dispatcher,
        authenticated: bool,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<Outbound>) {
        dispatcher
            .registry()
            .register(TransportKind::WebSocket, None, authenticated, None)
            .await
    }

    fn request(id: &str, kind: MessageType, payload: Value) -> MessageEnvelope {
        MessageEnvelope {
            id: id.to_string(),
            kind,
            timestamp: 0,
            payload,
        }
    }

    #[tokio::test]
    async fn ping_round_trip_keeps_id() {
        let dispatcher = dispatcher(None);
        let (session, mut rx) = connect(&dispatcher, true).await;

        let reply = dispatcher
            .handle_inbound(&session, request("x", MessageType::Ping, json!({ "n": 42 })))
            .await
            .expect("reply");

        assert_eq!(reply.id, "x");
        assert_eq!(reply.kind, MessageType::Ping);
        assert_eq!(reply.payload["n"], 42);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));
    }

    #[tokio::test]
    async fn unknown_type_gets_error_with_same_id() {
        let dispatcher = dispatcher(None);
        let (session, _rx) = connect(&dispatcher, true).await;

        let reply = dispatcher
            .handle_inbound(
                &session,
                request("u1", MessageType::Custom("mystery".to_string()), Value::Null),
            )
            .await
            .expect("reply");

        assert!(reply.is_error());
        assert_eq!(reply.id, "u1");
        assert_eq!(reply.payload["code"], codes::UNKNOWN_TYPE);
    }

    #[tokio::test]
    async fn unauthenticated_requests_are_rejected_but_connection_stays() {
        let dispatcher = dispatcher(Some("s3cret"));
        let (session, _rx) = connect(&dispatcher, false).await;

        let reply = dispatcher
            .handle_inbound(&session, request("p1", MessageType::Ping, Value::Null))
            .await
            .expect("reply");

        assert_eq!(reply.payload["code"], codes::UNAUTHENTICATED);
        assert!(dispatcher.registry().get(&session.connection_id).await.is_some());
    }

    #[tokio::test]
    async fn auth_handshake_ungates_connection() {
        let dispatcher = dispatcher(Some("s3cret"));
        let (session, _rx) = connect(&dispatcher, false).await;

        let reply = dispatcher
            .handle_inbound(
                &session,
                request("a1", MessageType::Auth, json!({ "token": "s3cret" })),
            )
            .await
            .expect("auth reply");
        assert_eq!(reply.id, "a1");
        assert_eq!(reply.payload["authenticated"], true);

        // The stale handle still says unauthenticated; the registry wins.
        let ping = dispatcher
            .handle_inbound(&session, request("p2", MessageType::Ping, json!("hi")))
            .await
            .expect("ping reply");
        assert_eq!(ping.payload, json!("hi"));
    }

    #[tokio::test]
    async fn failed_handshake_closes_connection() {
        let dispatcher = dispatcher(Some("s3cret"));
        let (session, mut rx) = connect(&dispatcher, false).await;

        let reply = dispatcher
            .handle_inbound(
                &session,
                request("a2", MessageType::Auth, json!({ "token": "guess" })),
            )
            .await
            .expect("auth reply");

        assert_eq!(reply.payload["code"], codes::AUTH_FAILED);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Frame(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(dispatcher.registry().get(&session.connection_id).await.is_none());
    }

    #[tokio::test]
    async fn handler_errors_and_panics_become_error_envelopes() {
        let dispatcher = dispatcher(None);
        dispatcher
            .register(
                MessageType::Custom("fail".to_string()),
                handler_fn(|_, _| async { Err::<Value, _>(BridgeError::Handler("boom".to_string())) }),
            )
            .expect("register fail");
        dispatcher
            .register(MessageType::Custom("panic".to_string()), Arc::new(PanickingHandler))
            .expect("register panic");
        let (session, _rx) = connect(&dispatcher, true).await;

        let failed = dispatcher
            .handle_inbound(
                &session,
                request("f", MessageType::Custom("fail".to_string()), Value::Null),
            )
            .await
            .expect("fail reply");
        assert_eq!(failed.payload["code"], codes::HANDLER_FAILED);

        let panicked = dispatcher
            .handle_inbound(
                &session,
                request("p", MessageType::Custom("panic".to_string()), Value::Null),
            )
            .await
            .expect("panic reply");
        assert_eq!(panicked.id, "p");
        assert_eq!(panicked.payload["code"], codes::HANDLER_FAILED);

        // The connection keeps working afterwards.
        let ping = dispatcher
            .handle_inbound(&session, request("ok", MessageType::Ping, Value::Null))
            .await
            .expect("ping reply");
        assert!(!ping.is_error());
    }

    #[test]
    fn registration_rejects_reserved_and_duplicate_types() {
        let dispatcher = dispatcher(None);
        assert!(dispatcher
            .register(MessageType::Auth, Arc::new(PingHandler))
            .is_err());
        assert!(dispatcher
            .register(MessageType::Ping, Arc::new(PingHandler))
            .is_err());
        assert!(dispatcher
            .replace(MessageType::Ping, Arc::new(PingHandler))
            .is_ok());
    }

    #[tokio::test]
    async fn inbound_after_disconnect_is_dropped() {
        let dispatcher = dispatcher(None);
        let (session, _rx) = connect(&dispatcher, true).await;
        dispatcher.registry().remove(&session.connection_id).await;

        let reply = dispatcher
            .handle_inbound(&session, request("late", MessageType::Ping, Value::Null))
            .await;
        assert!(reply.is_none());
    }
}
