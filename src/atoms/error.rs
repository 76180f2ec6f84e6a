// ── Gisma Atoms: Error Types ───────────────────────────────────────────────
// Single canonical error enum for the link, built with `thiserror`.
//
// Design rules:
//   • Variants are coarse-grained by domain (transport, protocol, session, API…).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • Connect failures use the cloneable `ConnectError` so every caller joined
//     to one in-flight attempt receives the same outcome.
//   • No variant carries session cookies or passwords in its message.

use thiserror::Error;

// ── Connect failures ───────────────────────────────────────────────────────

/// Outcome of a failed connection attempt. Cheap to clone: a single in-flight
/// attempt is shared by every concurrent `connect()` caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// No `CONNECTED` frame within the configured window.
    #[error("Connection timeout after {0}ms - server may be unreachable or overloaded")]
    Timeout(u64),

    /// The socket could not be opened or died during the handshake.
    #[error("WebSocket error: {0}")]
    Transport(String),

    /// The server answered with a STOMP `ERROR` frame or something unparseable.
    #[error("STOMP error: {0}")]
    Protocol(String),

    /// `disconnect()` was called while the attempt was still in flight.
    #[error("Connection attempt cancelled")]
    Cancelled,
}

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LinkError {
    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Connection establishment timed out.
    #[error("Connection timeout after {0}ms")]
    Timeout(u64),

    /// Socket-level failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed frame or payload, or a STOMP `ERROR` from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A publish needed a live connection and none could be established.
    #[error("Not connected: {0}")]
    NotConnected(String),

    /// Chat operation attempted without a valid session.
    #[error("User not authenticated")]
    Unauthenticated,

    /// Continuing a chat without a known chat id.
    #[error("Chat ID is missing")]
    MissingChatId,

    /// REST endpoint answered with a non-success status.
    #[error("API error: {status}: {message}")]
    Api { status: u16, message: String },

    /// Client configuration is invalid or missing.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not yet have a dedicated variant.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl LinkError {
    /// Create an API error with status and message.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api { status, message: message.into() }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Whether the automatic reconnect loop can be expected to recover.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Transport(_) | Self::NotConnected(_) | Self::Network(_)
        )
    }
}

impl From<ConnectError> for LinkError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::Timeout(ms) => LinkError::Timeout(ms),
            ConnectError::Transport(m) => LinkError::Transport(m),
            ConnectError::Protocol(m) => LinkError::Protocol(m),
            ConnectError::Cancelled => LinkError::NotConnected("connection cancelled".into()),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for LinkError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        LinkError::Transport(e.to_string())
    }
}

// ── Migration bridge: String → LinkError ───────────────────────────────────

impl From<String> for LinkError {
    fn from(s: String) -> Self {
        LinkError::Other(s)
    }
}

impl From<&str> for LinkError {
    fn from(s: &str) -> Self {
        LinkError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All link operations should return this type.
pub type LinkResult<T> = Result<T, LinkError>;

impl From<LinkError> for String {
    fn from(e: LinkError) -> Self {
        e.to_string()
    }
}
