//! Local bridge between editor workspaces and external clients.
//!
//! A server binds a port derived from its workspace identity and serves
//! `MessageEnvelope`s over WebSocket or HTTP long-polling. Clients find it by
//! scanning for `/health` and hold one `ConnectionSession` to it.

pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod port;
pub mod protocol;
pub mod server;
pub mod services;
pub mod workspace;

pub use client::{ConnectionSession, ConnectionState, SessionStatus, Subscription};
pub use config::{BridgeConfig, ClientConfig};
pub use error::{BridgeError, ConnectError};
pub use protocol::{MessageEnvelope, MessageType, TransportKind};
pub use server::BridgeServer;
pub use workspace::WorkspaceIdentity;
