//! Client transports. A `Connector` opens a `Link`: an ordered outbound queue
//! of JSON frames and an inbound stream of frames ending in `Closed`.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, Message,
};
use tracing::debug;

use crate::error::BridgeError;
use crate::protocol::TransportKind;

/// Upper bound on one long-poll request; the server answers within its own
/// poll wait, so this only trips on a wedged server.
pub const POLL_REQUEST_TIMEOUT: Duration = Duration::from_secs(35);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub token: Option<String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Frame(String),
    Closed(Option<String>),
}

/// Aborts the connector's background reader when the link is dropped.
#[derive(Debug, Default)]
pub struct TaskGuard(Vec<JoinHandle<()>>);

impl TaskGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self(tasks)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// One open transport. Dropping the outbound sender closes it gracefully.
#[derive(Debug)]
pub struct Link {
    pub kind: TransportKind,
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
    pub guard: TaskGuard,
}

impl Link {
    pub fn new(
        kind: TransportKind,
        outbound: mpsc::UnboundedSender<String>,
        inbound: mpsc::UnboundedReceiver<LinkEvent>,
    ) -> Self {
        Self {
            kind,
            outbound,
            inbound,
            guard: TaskGuard::default(),
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> TransportKind;
    async fn open(&self, endpoint: &Endpoint) -> Result<Link, BridgeError>;
}

#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Link, BridgeError> {
        let mut request = endpoint
            .ws_url()
            .into_client_request()
            .map_err(|error| BridgeError::Transport(error.to_string()))?;
        if let Some(token) = &endpoint.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|error| BridgeError::Transport(error.to_string()))?;
            request.headers_mut().insert("authorization", value);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|error| BridgeError::Transport(format!("websocket connect failed: {error}")))?;
        let (mut sink, mut stream) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Frame(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Some(
                            frame
                                .map(|frame| frame.reason.to_string())
                                .filter(|reason| !reason.is_empty())
                                .unwrap_or_else(|| "closed by server".to_string()),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => break Some(error.to_string()),
                    None => break Some("connection lost".to_string()),
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(Link {
            kind: TransportKind::WebSocket,
            outbound: out_tx,
            inbound: in_rx,
            guard: TaskGuard::new(vec![reader]),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct PollingConnector {
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct OpenResponse {
    sid: String,
}

impl PollingConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

fn with_bearer(request: reqwest::RequestBuilder, token: Option<&str>) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}

#[async_trait]
impl Connector for PollingConnector {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Link, BridgeError> {
        let base = endpoint.http_base();
        let response = with_bearer(
            self.client.post(format!("{base}/poll")),
            endpoint.token.as_deref(),
        )
        .send()
        .await
        .map_err(|error| BridgeError::Transport(format!("polling open failed: {error}")))?;
        if !response.status().is_success() {
            return Err(BridgeError::Transport(format!(
                "polling open rejected: {}",
                response.status()
            )));
        }
        let OpenResponse { sid } = response
            .json()
            .await
            .map_err(|error| BridgeError::Transport(error.to_string()))?;
        let session_url = format!("{base}/poll/{sid}");
        debug!(%sid, "polling connection opened");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        let client = self.client.clone();
        let url = session_url.clone();
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                let sent = client
                    .post(&url)
                    .header("content-type", "application/json")
                    .body(text)
                    .send()
                    .await;
                match sent {
                    Ok(response) if response.status().is_success() => {}
                    _ => return,
                }
            }
            let _ = client.delete(&url).send().await;
        });

        let client = self.client.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                let response = match client
                    .get(&session_url)
                    .timeout(POLL_REQUEST_TIMEOUT)
                    .send()
                    .await
                {
                    Ok(response) => response,
                    Err(error) => break Some(format!("poll failed: {error}")),
                };

                match response.status() {
                    StatusCode::OK => {}
                    StatusCode::NOT_FOUND | StatusCode::GONE => {
                        break Some("closed by server".to_string());
                    }
                    status => break Some(format!("poll failed: {status}")),
                }

                let frames = match response.json::<Vec<Value>>().await {
                    Ok(frames) => frames,
                    Err(error) => break Some(format!("invalid poll body: {error}")),
                };
                for frame in frames {
                    if in_tx.send(LinkEvent::Frame(frame.to_string())).is_err() {
                        return;
                    }
                }
            };
            let _ = in_tx.send(LinkEvent::Closed(reason));
        });

        Ok(Link {
            kind: TransportKind::Polling,
            outbound: out_tx,
            inbound: in_rx,
            guard: TaskGuard::new(vec![reader]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls() {
        let endpoint = Endpoint::new("127.0.0.1", 37142);
        assert_eq!(endpoint.http_base(), "http://127.0.0.1:37142");
        assert_eq!(endpoint.ws_url(), "ws://127.0.0.1:37142/ws");
    }

    #[tokio::test]
    async fn websocket_open_fails_on_closed_port() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let error = WebSocketConnector
            .open(&Endpoint::new("127.0.0.1", port))
            .await
            .expect_err("nothing listening");
        assert!(matches!(error, BridgeError::Transport(_)));
    }

    #[tokio::test]
    async fn polling_open_fails_on_closed_port() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let error = PollingConnector::new()
            .open(&Endpoint::new("127.0.0.1", port))
            .await
            .expect_err("nothing listening");
        assert!(matches!(error, BridgeError::Transport(_)));
    }
}
