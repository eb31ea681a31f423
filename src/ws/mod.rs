//! WebSocket Client Registry
//!
//! Tracks any number of client connections by small integer handle and
//! pushes their events to a consumer-supplied sink. Handshake, framing and
//! ping/pong are left to tokio-tungstenite.
//!
//! No Bevy dependencies - this can be used standalone.

mod config;
mod connection;
mod error;
mod event;
mod poll;
mod registry;

pub use config::ClientConfig;
pub use connection::{MAX_CLOSE_REASON_BYTES, NORMAL_CLOSURE, ReadyState};
pub use error::{WebSocketError, WsResult};
pub use event::{EventChannel, WebSocketEvent, WebSocketEventSink};
pub use poll::PollReceiver;
pub use registry::{DISCONNECT_REASON, INVALID_HANDLE, SHUTDOWN_REASON, WebSocketRegistry};
