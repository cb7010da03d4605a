use serde_json::{json, Value};

/// Wire error codes carried in `error` envelopes.
pub mod codes {
    pub const PARSE_ERROR: &str = "PARSE_ERROR";
    pub const INVALID_PARAMS: &str = "INVALID_PARAMS";
    pub const UNKNOWN_TYPE: &str = "UNKNOWN_TYPE";
    pub const UNAUTHENTICATED: &str = "UNAUTHENTICATED";
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const UNSUPPORTED: &str = "UNSUPPORTED";
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const NOT_CONNECTED: &str = "NOT_CONNECTED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no free port in {start}..={end}")]
    NoPortAvailable { start: u16, end: u16 },

    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("connection is not authenticated")]
    Unauthenticated,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    pub fn code(&self) -> &str {
        match self {
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::UnknownType(_) => codes::UNKNOWN_TYPE,
            Self::Unauthenticated => codes::UNAUTHENTICATED,
            Self::AuthFailed(_) => codes::AUTH_FAILED,
            Self::Unsupported(_) => codes::UNSUPPORTED,
            Self::Handler(_) => codes::HANDLER_FAILED,
            Self::NotConnected => codes::NOT_CONNECTED,
            Self::Timeout(_) => codes::TIMEOUT,
            Self::Json(_) => codes::PARSE_ERROR,
            Self::Remote { code, .. } => code.as_str(),
            Self::Config(_) | Self::NoPortAvailable { .. } | Self::Transport(_) | Self::Io(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Payload of an `error` envelope describing this failure.
    pub fn to_payload(&self) -> Value {
        let message = match self {
            Self::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        json!({
            "code": self.code(),
            "message": message,
        })
    }

    /// Rebuild a remote error from an `error` envelope payload.
    pub fn from_payload(payload: &Value) -> Self {
        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or(codes::INTERNAL_ERROR)
            .to_string();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown remote error")
            .to_string();
        Self::Remote { code, message }
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Terminal failure of a `connect()` call.
///
/// Cloneable so every caller sharing one in-flight attempt sees the same error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("session is closed")]
    Closed,

    #[error("connect attempt aborted by disconnect")]
    Aborted,
}
