//! Error types for the WebSocket registry.
//!
//! These only surface through the typed `try_*` API. The flat entry points
//! (`connect`, `send`, ...) log them and return `-1` / `false` instead.

use thiserror::Error;

/// Result alias used throughout the `ws` module.
pub type WsResult<T> = Result<T, WebSocketError>;

#[derive(Debug, Error)]
pub enum WebSocketError {
    /// `shutdown()` was called; the registry accepts no new connections.
    #[error("registry has been shut down")]
    RegistryClosed,

    /// Every positive `i32` handle has been handed out.
    #[error("no handle IDs left to assign")]
    HandleSpaceExhausted,

    /// A configured header name or value cannot be put on the wire.
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },

    /// The owned tokio runtime could not be built.
    #[error("failed to start WebSocket runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("WebSocket {0} not found")]
    UnknownHandle(i32),

    /// The connection is closing or closed and refuses new messages.
    #[error("WebSocket {0} is not writable")]
    NotWritable(i32),

    #[error("message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },

    /// The connection task has already exited.
    #[error("WebSocket {0} outbound queue is closed")]
    QueueClosed(i32),
}
