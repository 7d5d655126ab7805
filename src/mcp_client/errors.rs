//! Backend link error types.

use thiserror::Error;

/// Errors that can occur while driving a single backend process.
#[derive(Debug, Error)]
pub enum McpError {
    /// The backend process failed to start.
    #[error("failed to spawn server '{name}': {reason}")]
    SpawnFailed {
        name: String,
        reason: String,
    },

    /// The initialize handshake or the tool listing failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed {
        name: String,
        reason: String,
    },

    /// I/O or serialization failure on the process pipes.
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// Backend returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No response arrived before the request deadline.
    #[error("request '{method}' timed out after {timeout_ms}ms")]
    Timeout {
        method: String,
        timeout_ms: u64,
    },

    /// The link was used before `start()` succeeded.
    #[error("server '{name}' is not running")]
    NotStarted {
        name: String,
    },

    /// Configuration error (bad server entry, unreadable config file).
    #[error("config error: {reason}")]
    Config {
        reason: String,
    },
}

impl McpError {
    /// Whether this error is the local request deadline firing.
    pub fn is_timeout(&self) -> bool {
        matches!(self, McpError::Timeout { .. })
    }
}
