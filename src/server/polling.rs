//! HTTP long-polling transport, the fallback when WebSocket cannot be opened.
//!
//! Each polling connection owns a task that dispatches its inbound frames in
//! submission order and reaps the connection once it stops being polled.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};

use super::auth::Credentials;
use super::registry::{Outbound, SessionHandle};
use super::{AppState, TokenQuery};
use crate::protocol::TransportKind;

pub(crate) struct PollChannel {
    outbound: Mutex<mpsc::UnboundedReceiver<Outbound>>,
    inbound: mpsc::UnboundedSender<String>,
    last_seen: std::sync::Mutex<Instant>,
}

impl PollChannel {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}

#[derive(Default)]
pub(crate) struct PollChannels {
    channels: RwLock<HashMap<String, Arc<PollChannel>>>,
}

impl PollChannels {
    async fn insert(&self, connection_id: String, channel: Arc<PollChannel>) {
        self.channels.write().await.insert(connection_id, channel);
    }

    async fn get(&self, connection_id: &str) -> Option<Arc<PollChannel>> {
        self.channels.read().await.get(connection_id).cloned()
    }

    pub(crate) async fn remove(&self, connection_id: &str) -> Option<Arc<PollChannel>> {
        self.channels.write().await.remove(connection_id)
    }
}

pub(crate) fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/poll", post(open_handler)).route(
        "/poll/{sid}",
        get(poll_handler).post(submit_handler).delete(close_handler),
    )
}

async fn open_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Json<Value> {
    let credentials = Credentials::from_request(
        &headers,
        query.token.as_deref(),
        state.config.allow_query_token_auth,
    );
    let (handle, outbound) = state
        .accept(TransportKind::Polling, Some(remote), credentials)
        .await;

    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let channel = Arc::new(PollChannel {
        outbound: Mutex::new(outbound),
        inbound: inbound_tx,
        last_seen: std::sync::Mutex::new(Instant::now()),
    });
    state
        .polls
        .insert(handle.connection_id.clone(), channel)
        .await;

    let sid = handle.connection_id.clone();
    tokio::spawn(run_poll_connection(state, handle, inbound_rx));

    Json(json!({ "sid": sid }))
}

/// Dispatches inbound frames in order and reaps the connection when idle.
async fn run_poll_connection(
    state: Arc<AppState>,
    handle: SessionHandle,
    mut inbound: mpsc::UnboundedReceiver<String>,
) {
    let idle_limit = state.config.poll_idle;
    let period = (idle_limit / 4).clamp(Duration::from_millis(50), Duration::from_secs(5));
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(text) => state.dispatch_text(&handle, &text).await,
                None => break,
            },
            _ = ticker.tick() => {
                let Some(channel) = state.polls.get(&handle.connection_id).await else {
                    break;
                };
                if channel.idle_for() > idle_limit {
                    info!(conn_id = %handle.connection_id, "polling connection idle, reaping");
                    break;
                }
            }
        }
    }

    state.disconnect(&handle.connection_id).await;
}

async fn poll_handler(State(state): State<Arc<AppState>>, Path(sid): Path<String>) -> Response {
    let Some(channel) = state.polls.get(&sid).await else {
        return StatusCode::NOT_FOUND.into_response();
    };
    channel.touch();

    let mut frames: Vec<Arc<String>> = Vec::new();
    let mut closed = false;
    {
        let mut outbound = channel.outbound.lock().await;
        match tokio::time::timeout(state.config.poll_wait, outbound.recv()).await {
            Err(_) => {}
            Ok(None) | Ok(Some(Outbound::Close)) => closed = true,
            Ok(Some(Outbound::Frame(text))) => {
                frames.push(text);
                while let Ok(next) = outbound.try_recv() {
                    match next {
                        Outbound::Frame(text) => frames.push(text),
                        Outbound::Close => {
                            closed = true;
                            break;
                        }
                    }
                }
            }
        }
    }
    channel.touch();

    if closed {
        debug!(conn_id = %sid, "polling connection closed by server");
        state.polls.remove(&sid).await;
        if frames.is_empty() {
            return StatusCode::GONE.into_response();
        }
    }

    let body = format!(
        "[{}]",
        frames
            .iter()
            .map(|frame| frame.as_str())
            .collect::<Vec<_>>()
            .join(",")
    );
    ([(header::CONTENT_TYPE, "application/json")], body).into_response()
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Path(sid): Path<String>,
    body: String,
) -> StatusCode {
    let Some(channel) = state.polls.get(&sid).await else {
        return StatusCode::NOT_FOUND;
    };
    channel.touch();

    let frames = match serde_json::from_str::<Value>(&body) {
        Ok(Value::Array(items)) => items.iter().map(Value::to_string).collect(),
        Ok(value) => vec![value.to_string()],
        // Let the dispatcher answer with a parse error.
        Err(_) => vec![body],
    };

    for frame in frames {
        if channel.inbound.send(frame).is_err() {
            return StatusCode::GONE;
        }
    }
    StatusCode::ACCEPTED
}

async fn close_handler(State(state): State<Arc<AppState>>, Path(sid): Path<String>) -> StatusCode {
    if state.polls.remove(&sid).await.is_none() {
        return StatusCode::NOT_FOUND;
    }
    state.disconnect(&sid).await;
    StatusCode::NO_CONTENT
}
