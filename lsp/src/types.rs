//! Public types shared by the client and its callers.
//!
//! Callers hold an [`RpcClient`](crate::RpcClient), read its
//! [`ConnectionStatus`], receive [`RpcEvent`]s from a subscription and get
//! [`RpcError`]s back from failed requests.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where the language server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Lifecycle of a client connection.
///
/// `Initiated -> Connecting -> Connected -> Ending`, with `Error` reachable
/// from `Connecting`. `Ending` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Initiated,
    Connecting,
    Connected,
    Ending,
    Error,
}

impl ConnectionStatus {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Ending => "ending",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Category of a problem reported through [`RpcEvent::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventErrorKind {
    /// A response carried an id this client never issued.
    UnknownRequestId,
    /// A second response arrived for an id that was already settled.
    DuplicateResponse,
    /// Writing a request to the socket failed.
    TransportWrite,
    /// The inbound stream violated the base protocol; reading stopped.
    Framing,
    /// A complete body was not valid JSON; reading continues.
    BodyDecode,
}

/// Something the client observed, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// Any decoded inbound message, correlated or not.
    DataReceived(serde_json::Value),
    /// A request envelope is about to be written.
    RequestWillBeSent(serde_json::Value),
    /// A request envelope was fully written to the socket.
    RequestSent(serde_json::Value),
    Error {
        kind: EventErrorKind,
        context: String,
        detail: serde_json::Value,
    },
}

impl RpcEvent {
    /// The `method` of a received message, if it has one.
    #[must_use]
    pub fn received_method(&self) -> Option<&str> {
        match self {
            Self::DataReceived(message) => message.get("method").and_then(|m| m.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("client not connected (status: {status})")]
    NotConnected { status: ConnectionStatus },
    /// The server answered with a JSON-RPC `error` object.
    #[error("server returned an error for request {id}: {error}")]
    Application { id: u64, error: serde_json::Value },
    #[error("failed to write request {id}")]
    TransportWrite {
        id: u64,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write notification {method}")]
    NotificationWrite {
        method: String,
        #[source]
        source: std::io::Error,
    },
    #[error("connection closed before request {id} was answered")]
    ConnectionClosed { id: u64 },
    #[error("serializing JSON-RPC message")]
    Serialize(#[from] serde_json::Error),
}

/// Source of request ids: monotonically increasing, never reused.
///
/// Each client owns one by default. Hand the same generator to several
/// clients to give them one id space.
#[derive(Debug)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl RequestIdGenerator {
    #[must_use]
    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
