//! WebSocket Bevy Plugin
//!
//! Exposes a [`WebSocketRegistry`](crate::ws::WebSocketRegistry) as a Bevy
//! resource and turns connection events into Bevy messages.

mod plugin;

pub use plugin::{
    WebSocketEventReceiver, WebSocketMessage, WebSocketPlugin, WebSocketRegistryResource,
    disconnect_on_exit, forward_websocket_events,
};

// Re-export core types for convenience
pub use crate::ws::{ClientConfig, ReadyState, WebSocketEvent, WebSocketRegistry};
