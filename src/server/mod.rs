//! Bridge server: HTTP identification endpoint, WebSocket and long-polling
//! transports, session registry and dispatcher.
//!
//! | Route | Purpose |
//! |-------|---------|
//! | `GET /health` | identification probe used by discovery |
//! | `GET /ws` | WebSocket upgrade |
//! | `POST /poll` | open a polling connection |
//! | `GET /poll/{sid}` | long-poll queued envelopes |
//! | `POST /poll/{sid}` | submit envelopes |
//! | `DELETE /poll/{sid}` | close a polling connection |

pub mod auth;
pub mod dispatcher;
pub mod polling;
pub mod registry;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use self::auth::{Authenticator, Credentials, TokenAuthenticator};
use self::dispatcher::{Dispatcher, MessageHandler};
use self::polling::PollChannels;
use self::registry::{Outbound, SessionHandle, SessionRegistry};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::port::{assign_port, PortAssignment};
use crate::protocol::{
    error_envelope, now_iso, salvage_id, HealthStatus, MessageEnvelope, MessageType,
    TransportKind, Welcome, SERVICE_NAME, SERVICE_VERSION,
};
use crate::services::{ContextHandler, WorkspaceContextProvider};
use crate::workspace::WorkspaceIdentity;

pub(crate) struct AppState {
    config: BridgeConfig,
    identity: WorkspaceIdentity,
    started_at: Instant,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    polls: PollChannels,
}

impl AppState {
    /// Registers a new connection, running the auth collaborator on whatever
    /// credentials came with the HTTP request, and sends the welcome push.
    async fn accept(
        &self,
        transport: TransportKind,
        remote: Option<SocketAddr>,
        credentials: Credentials,
    ) -> (SessionHandle, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
        let outcome = self
            .dispatcher
            .authenticator()
            .authenticate(&credentials)
            .await;
        let (handle, rx) = self
            .registry
            .register(transport, remote, outcome.authenticated, outcome.identity)
            .await;

        info!(
            conn_id = %handle.connection_id,
            %transport,
            remote = ?remote,
            authenticated = handle.authenticated,
            "connection accepted"
        );

        let welcome = Welcome {
            connection_id: handle.connection_id.clone(),
            service: SERVICE_NAME.to_string(),
            version: SERVICE_VERSION.to_string(),
            auth_required: !handle.authenticated,
            workspace: Some(self.identity.hint()),
        };
        match serde_json::to_value(&welcome) {
            Ok(payload) => {
                self.registry
                    .send_to(
                        &handle.connection_id,
                        &MessageEnvelope::new(MessageType::Welcome, payload),
                    )
                    .await;
            }
            Err(error) => warn!(error = %error, "failed to serialize welcome"),
        }

        (handle, rx)
    }

    /// Parses one inbound frame and runs it through the dispatcher.
    async fn dispatch_text(&self, handle: &SessionHandle, text: &str) {
        match MessageEnvelope::from_json(text) {
            Ok(envelope) => {
                self.dispatcher.handle_inbound(handle, envelope).await;
            }
            Err(error) => {
                let reply = error_envelope(salvage_id(text), None, &error);
                self.registry.send_to(&handle.connection_id, &reply).await;
            }
        }
    }

    async fn disconnect(&self, connection_id: &str) {
        if self.registry.remove(connection_id).await.is_some() {
            info!(conn_id = %connection_id, "connection closed");
        }
        self.polls.remove(connection_id).await;
    }
}

/// The bridge server, ready to be bound and served.
#[derive(Clone)]
pub struct BridgeServer {
    state: Arc<AppState>,
}

impl BridgeServer {
    /// Server authenticating with the configured shared token.
    pub fn new(config: BridgeConfig, identity: WorkspaceIdentity) -> Self {
        let authenticator = Arc::new(TokenAuthenticator::new(config.auth_token.clone()));
        Self::with_authenticator(config, identity, authenticator)
    }

    pub fn with_authenticator(
        config: BridgeConfig,
        identity: WorkspaceIdentity,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), authenticator));
        Self {
            state: Arc::new(AppState {
                config,
                identity,
                started_at: Instant::now(),
                registry,
                dispatcher,
                polls: PollChannels::default(),
            }),
        }
    }

    /// Registers the filesystem-backed `context` handler.
    pub fn with_workspace_context(self) -> Result<Self> {
        let provider = WorkspaceContextProvider::new(self.state.identity.clone());
        self.register(
            MessageType::Context,
            Arc::new(ContextHandler::new(Arc::new(provider))),
        )?;
        Ok(self)
    }

    pub fn register(&self, kind: MessageType, handler: Arc<dyn MessageHandler>) -> Result<()> {
        self.state.dispatcher.register(kind, handler)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.state.registry.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.state.dispatcher.clone()
    }

    pub fn identity(&self) -> &WorkspaceIdentity {
        &self.state.identity
    }

    /// Pushes `envelope` to every authenticated connection.
    pub async fn broadcast(&self, envelope: &MessageEnvelope) -> usize {
        self.state.registry.broadcast(envelope).await
    }

    /// Pushes `envelope` to one connection; unknown ids are a no-op.
    pub async fn send_to(&self, connection_id: &str, envelope: &MessageEnvelope) -> bool {
        self.state.registry.send_to(connection_id, envelope).await
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ws", get(ws_handler))
            .merge(polling::routes())
            .with_state(self.state.clone())
    }

    /// Assigns the workspace port and binds it.
    pub fn bind(&self) -> Result<(PortAssignment, TcpListener)> {
        let config = &self.state.config;
        let (assignment, listener) = assign_port(
            &config.host,
            self.state.identity.id(),
            config.base_port,
            config.port_spread,
        )?;
        listener.set_nonblocking(true)?;
        Ok((assignment, TcpListener::from_std(listener)?))
    }

    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .await
            .map_err(|error| BridgeError::Transport(format!("server error: {error}")))
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthStatus> {
    Json(HealthStatus {
        service: SERVICE_NAME.to_string(),
        status: "ok".to_string(),
        version: SERVICE_VERSION.to_string(),
        at: now_iso(),
        uptime_sec: state.started_at.elapsed().as_secs(),
        workspace: Some(state.identity.hint()),
    })
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Response {
    let credentials = Credentials::from_request(
        &headers,
        query.token.as_deref(),
        state.config.allow_query_token_auth,
    );

    ws.on_upgrade(move |socket| handle_socket(socket, state, remote, credentials))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    remote: SocketAddr,
    credentials: Credentials,
) {
    let (mut socket_tx, mut socket_rx) = socket.split();
    let (handle, mut rx) = state
        .accept(TransportKind::WebSocket, Some(remote), credentials)
        .await;

    let mut writer_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Frame(text) => {
                    if socket_tx
                        .send(Message::Text(text.as_str().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = socket_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer_task => break,
            message = socket_rx.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    state.dispatch_text(&handle, text.as_str()).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let reply = error_envelope(
                        String::new(),
                        None,
                        &BridgeError::InvalidParams(
                            "binary websocket messages are not supported".to_string(),
                        ),
                    );
                    state.registry.send_to(&handle.connection_id, &reply).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(error)) => {
                    debug!(conn_id = %handle.connection_id, error = %error, "websocket error");
                    break;
                }
            },
        }
    }

    state.disconnect(&handle.connection_id).await;
    writer_task.abort();
}
