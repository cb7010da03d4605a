use async_trait::async_trait;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Credentials presented by a client, either on the HTTP upgrade or in the
/// `auth` handshake payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub token: Option<String>,
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// Reads a bearer token from `Authorization`, or from the query string when
    /// query-token auth is allowed.
    pub fn from_request(headers: &HeaderMap, query_token: Option<&str>, allow_query: bool) -> Self {
        if let Some(value) = headers.get("authorization") {
            if let Ok(raw) = value.to_str() {
                if let Some(token) = raw.strip_prefix("Bearer ") {
                    return Self::token(token.trim());
                }
            }
        }

        if allow_query {
            if let Some(token) = query_token.filter(|token| !token.is_empty()) {
                return Self::token(token);
            }
        }

        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOutcome {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl AuthOutcome {
    pub fn granted(identity: impl Into<String>) -> Self {
        Self {
            authenticated: true,
            identity: Some(identity.into()),
        }
    }

    pub fn denied() -> Self {
        Self {
            authenticated: false,
            identity: None,
        }
    }
}

/// External authentication collaborator.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credentials: &Credentials) -> AuthOutcome;
}

/// Shared-secret authenticator. Without a configured token every client is
/// accepted (local development only).
#[derive(Debug, Clone, Default)]
pub struct TokenAuthenticator {
    expected: Option<String>,
}

impl TokenAuthenticator {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, credentials: &Credentials) -> AuthOutcome {
        let Some(expected) = &self.expected else {
            return AuthOutcome::granted("anonymous");
        };

        match credentials.token.as_deref() {
            Some(token) if token == expected => AuthOutcome::granted("token"),
            _ => AuthOutcome::denied(),
        }
    }
}
