//! Error types for the pipeline client

use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline client operations
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors raised while talking to a media pipeline server
#[derive(Debug, Error)]
pub enum ClientError {
    /// The WebSocket handshake with the server failed
    #[error("failed to connect to {uri}: {reason}")]
    Connect { uri: String, reason: String },

    /// The WebSocket failed after the connection was established
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// The server answered a request with a JSON-RPC error object
    #[error("remote error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The server sent something that does not follow the protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection is closed; no more requests can be sent
    #[error("connection closed")]
    Closed,

    /// No response arrived within the request timeout
    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// True if the error means the connection itself is gone
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Self::Closed | Self::WebSocket(_))
    }
}
