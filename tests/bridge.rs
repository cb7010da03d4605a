use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use workspace_bridge::client::transport::Endpoint;
use workspace_bridge::discovery::{ScanConfig, Scanner};
use workspace_bridge::error::codes;
use workspace_bridge::server::dispatcher::handler_fn;
use workspace_bridge::{
    BridgeConfig, BridgeError, BridgeServer, ClientConfig, ConnectError, ConnectionSession, ConnectionState,
    MessageEnvelope, MessageType, Subscription, TransportKind, WorkspaceIdentity,
};

struct Running {
    server: BridgeServer,
    port: u16,
    _dir: tempfile::TempDir,
}

async fn start(config: BridgeConfig) -> Running {
    let dir = tempfile::tempdir().expect("create workspace dir");
    std::fs::write(dir.path().join("README.md"), "# demo\n").expect("write fixture");
    let identity = WorkspaceIdentity::from_roots(&[dir.path()]);
    let server = BridgeServer::new(config, identity)
        .with_workspace_context()
        .expect("register context handler");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(server.clone().serve(listener));

    Running {
        server,
        port,
        _dir: dir,
    }
}

fn open_config() -> BridgeConfig {
    BridgeConfig {
        allow_insecure_no_auth: true,
        ..BridgeConfig::default()
    }
}

fn token_config(token: &str) -> BridgeConfig {
    BridgeConfig {
        auth_token: Some(token.to_string()),
        ..BridgeConfig::default()
    }
}

fn client(running: &Running, transports: Vec<TransportKind>, token: Option<&str>) -> ConnectionSession {
    let config = ClientConfig {
        connect_timeout: Duration::from_secs(2),
        max_retries: 1,
        auth_token: token.map(str::to_string),
        transports,
        ..ClientConfig::default()
    };
    ConnectionSession::new(config, Endpoint::new("127.0.0.1", running.port))
}

async fn wait_for_sessions(server: &BridgeServer, expected: usize) {
    let registry = server.registry();
    tokio::time::timeout(Duration::from_secs(5), async {
        while registry.len().await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("registry reached expected size");
}

#[tokio::test]
async fn health_identifies_the_bridge() {
    let running = start(open_config()).await;

    let scanner = Scanner::new(ScanConfig::default());
    let result = scanner.scan_one("127.0.0.1", running.port).await;
    assert!(result.reachable);
    assert!(result.is_target_service);
    assert_eq!(
        result.workspace_hint.map(|hint| hint.id),
        Some(running.server.identity().id().to_string())
    );
}

#[tokio::test]
async fn websocket_client_round_trips_ping() {
    let running = start(token_config("secret")).await;
    let session = client(&running, vec![TransportKind::WebSocket], Some("secret"));

    session.connect().await.expect("connect over websocket");
    assert_eq!(session.state(), ConnectionState::Connected);
    assert_eq!(session.transport_name(), Some("websocket"));

    let reply = session
        .request(MessageType::Ping, json!({ "seq": 1 }), Duration::from_secs(2))
        .await
        .expect("ping reply");
    assert_eq!(reply.payload, json!({ "seq": 1 }));
}

#[tokio::test]
async fn polling_only_client_reads_workspace_context() {
    let running = start(open_config()).await;
    let session = client(&running, vec![TransportKind::Polling], None);

    session.connect().await.expect("connect over polling");
    assert_eq!(session.transport_name(), Some("polling"));

    let reply = session
        .request(
            MessageType::Context,
            json!({ "kind": "file", "params": { "path": "README.md" } }),
            Duration::from_secs(5),
        )
        .await
        .expect("context reply");
    assert_eq!(reply.payload["kind"], "file");
    assert_eq!(reply.payload["data"]["content"], "# demo\n");
}

#[tokio::test]
async fn default_client_prefers_websocket() {
    let running = start(open_config()).await;
    let session = client(
        &running,
        vec![TransportKind::WebSocket, TransportKind::Polling],
        None,
    );

    session.connect().await.expect("connect");
    assert_eq!(session.transport_name(), Some("websocket"));
    wait_for_sessions(&running.server, 1).await;
    let handle = running
        .server
        .registry()
        .get(&session.status().connection_id.expect("connection id"))
        .await
        .expect("registered");
    assert_eq!(handle.transport, TransportKind::WebSocket);
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let running = start(token_config("secret")).await;
    let session = client(&running, vec![TransportKind::WebSocket], Some("guess"));

    let error = session.connect().await.expect_err("bad token");
    assert!(matches!(error, ConnectError::AuthRejected(_)));
    assert_eq!(session.state(), ConnectionState::Disconnected);
    wait_for_sessions(&running.server, 0).await;
}

#[tokio::test]
async fn broadcast_reaches_client_handlers() {
    let running = start(open_config()).await;
    let session = client(&running, vec![TransportKind::WebSocket], None);
    session.connect().await.expect("connect");

    let (tx, mut rx) = mpsc::unbounded_channel();
    session.on(Subscription::Type(MessageType::from("file_changed")), move |envelope| {
        let _ = tx.send(envelope.payload.clone());
        Ok(())
    });

    let delivered = running
        .server
        .broadcast(&MessageEnvelope::new(
            MessageType::from("file_changed"),
            json!({ "path": "src/lib.rs" }),
        ))
        .await;
    assert_eq!(delivered, 1);

    let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("push delivered")
        .expect("handler alive");
    assert_eq!(payload, json!({ "path": "src/lib.rs" }));
}

#[tokio::test]
async fn disconnect_releases_server_session() {
    let running = start(open_config()).await;
    let session = client(&running, vec![TransportKind::WebSocket], None);
    session.connect().await.expect("connect");
    let connection_id = session.status().connection_id.expect("connection id");
    wait_for_sessions(&running.server, 1).await;

    session.disconnect();
    wait_for_sessions(&running.server, 0).await;

    let sent = running
        .server
        .send_to(&connection_id, &MessageEnvelope::new(MessageType::Ping, Value::Null))
        .await;
    assert!(!sent);
}

#[tokio::test]
async fn stalled_handler_blocks_only_its_own_connection() {
    let running = start(open_config()).await;
    running
        .server
        .register(
            MessageType::from("stall"),
            handler_fn(|_, _| futures_util::future::pending::<Result<Value, BridgeError>>()),
        )
        .expect("register stall handler");

    let stuck = client(&running, vec![TransportKind::WebSocket], None);
    let healthy = client(&running, vec![TransportKind::WebSocket], None);
    stuck.connect().await.expect("connect stuck client");
    healthy.connect().await.expect("connect healthy client");

    stuck
        .emit(&MessageEnvelope::new(MessageType::from("stall"), Value::Null))
        .expect("send stall");
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (behind_stall, other) = tokio::join!(
        stuck.request(MessageType::Ping, json!("a"), Duration::from_millis(300)),
        healthy.request(MessageType::Ping, json!("b"), Duration::from_secs(2)),
    );
    assert!(matches!(behind_stall, Err(BridgeError::Timeout(_))));
    assert_eq!(other.expect("other connection served").payload, json!("b"));
}

#[tokio::test]
async fn idle_polling_connection_is_reaped() {
    let running = start(BridgeConfig {
        poll_idle: Duration::from_millis(200),
        ..open_config()
    })
    .await;

    let response: Value = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/poll", running.port))
        .send()
        .await
        .expect("open polling connection")
        .json()
        .await
        .expect("sid body");
    assert!(response["sid"].as_str().is_some());
    wait_for_sessions(&running.server, 1).await;

    wait_for_sessions(&running.server, 0).await;
}

async fn next_envelope<S>(stream: &mut S) -> MessageEnvelope
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("frame in time")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            return MessageEnvelope::from_json(text.as_str()).expect("envelope");
        }
    }
}

#[tokio::test]
async fn unauthenticated_connection_must_send_auth_first() {
    let running = start(token_config("secret")).await;
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", running.port))
        .await
        .expect("websocket upgrade");
    let (mut sink, mut stream) = socket.split();

    let welcome = next_envelope(&mut stream).await;
    assert_eq!(welcome.kind, MessageType::Welcome);
    assert_eq!(welcome.payload["authRequired"], true);

    let ping = MessageEnvelope::new(MessageType::Ping, json!({}));
    sink.send(Message::Text(ping.to_json().expect("json").into()))
        .await
        .expect("send ping");
    let refused = next_envelope(&mut stream).await;
    assert_eq!(refused.id, ping.id);
    assert_eq!(refused.payload["code"], codes::UNAUTHENTICATED);

    let auth = MessageEnvelope::new(MessageType::Auth, json!({ "token": "secret" }));
    sink.send(Message::Text(auth.to_json().expect("json").into()))
        .await
        .expect("send auth");
    let accepted = next_envelope(&mut stream).await;
    assert_eq!(accepted.id, auth.id);
    assert_eq!(accepted.payload["authenticated"], true);

    sink.send(Message::Text(ping.to_json().expect("json").into()))
        .await
        .expect("send ping again");
    let pong = next_envelope(&mut stream).await;
    assert_eq!(pong.kind, MessageType::Ping);
}

#[tokio::test]
async fn unknown_type_and_bad_json_get_error_replies() {
    let running = start(open_config()).await;
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", running.port))
        .await
        .expect("websocket upgrade");
    let (mut sink, mut stream) = socket.split();
    next_envelope(&mut stream).await;

    let unknown = MessageEnvelope::new(MessageType::from("teleport"), json!({}));
    sink.send(Message::Text(unknown.to_json().expect("json").into()))
        .await
        .expect("send unknown");
    let reply = next_envelope(&mut stream).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.id, unknown.id);
    assert_eq!(reply.payload["code"], codes::UNKNOWN_TYPE);

    sink.send(Message::Text(r#"{"id":"abc","type":"#.into()))
        .await
        .expect("send garbage");
    let reply = next_envelope(&mut stream).await;
    assert_eq!(reply.kind, MessageType::Error);
    assert_eq!(reply.payload["code"], codes::PARSE_ERROR);
}
