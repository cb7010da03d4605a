//! Message envelope shared by the bridge server and its clients.
//!
//! Every frame on every transport is one JSON envelope:
//! `{ "id": string, "type": string, "timestamp": ms-epoch, "payload": any }`.
//! A response reuses the id of the request it answers; server pushes carry a
//! fresh id.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BridgeError;

/// Self-identification marker returned by `GET /health`.
pub const SERVICE_NAME: &str = "workspace-bridge";
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Duplex mechanism carrying envelopes between client and server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Persistent push channel.
    WebSocket,
    /// HTTP long-polling fallback.
    Polling,
}

impl TransportKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Welcome,
    Auth,
    Ping,
    Context,
    ConnectionStatus,
    Error,
    Custom(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Welcome => "welcome",
            Self::Auth => "auth",
            Self::Ping => "ping",
            Self::Context => "context",
            Self::ConnectionStatus => "connection_status",
            Self::Error => "error",
            Self::Custom(tag) => tag.as_str(),
        }
    }

    /// Types owned by the protocol itself; user handlers may not claim them.
    pub fn is_reserved(&self) -> bool {
        matches!(
            self,
            Self::Welcome | Self::Auth | Self::ConnectionStatus | Self::Error
        )
    }
}

impl From<&str> for MessageType {
    fn from(value: &str) -> Self {
        match value {
            "welcome" => Self::Welcome,
            "auth" => Self::Auth,
            "ping" => Self::Ping,
            "context" => Self::Context,
            "connection_status" => Self::ConnectionStatus,
            "error" => Self::Error,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub timestamp: i64,
    #[serde(default)]
    pub payload: Value,
}

impl MessageEnvelope {
    /// New envelope with a fresh id, used for requests and pushes.
    pub fn new(kind: MessageType, payload: Value) -> Self {
        Self {
            id: new_message_id(),
            kind,
            timestamp: now_millis(),
            payload,
        }
    }

    /// Response to `self`, sharing its id and type.
    pub fn reply(&self, payload: Value) -> Self {
        Self {
            id: self.id.clone(),
            kind: self.kind.clone(),
            timestamp: now_millis(),
            payload,
        }
    }

    /// Error response to `self`; the original type is echoed in the payload.
    pub fn error_reply(&self, error: &BridgeError) -> Self {
        error_envelope(self.id.clone(), Some(&self.kind), error)
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageType::Error
    }

    pub fn to_json(&self) -> Result<String, BridgeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        Ok(serde_json::from_str(text)?)
    }
}

pub fn error_envelope(
    id: String,
    request_type: Option<&MessageType>,
    error: &BridgeError,
) -> MessageEnvelope {
    let mut payload = error.to_payload();
    if let Some(kind) = request_type {
        payload["requestType"] = json!(kind.as_str());
    }
    MessageEnvelope {
        id,
        kind: MessageType::Error,
        timestamp: now_millis(),
        payload,
    }
}

/// Best-effort id extraction from a frame that failed to parse as an envelope,
/// so the error reply can still be correlated.
pub fn salvage_id(text: &str) -> String {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|value| value.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// Body of the `welcome` push sent when a connection is accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub connection_id: String,
    pub service: String,
    pub version: String,
    pub auth_required: bool,
    pub workspace: Option<WorkspaceHint>,
}

/// Workspace metadata advertised by `/health` and the welcome push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceHint {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Response body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub service: String,
    pub status: String,
    pub version: String,
    pub at: String,
    pub uptime_sec: u64,
    pub workspace: Option<WorkspaceHint>,
}
