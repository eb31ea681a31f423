//! # WebSocket Client Registry for Bevy
//!
//! Manages many WebSocket client connections behind small integer handles,
//! with connection events pushed to the game as Bevy messages.
//!
//! ## Example
//!
//! ```no_run
//! use bevy::prelude::*;
//! use bevy_ws_registry::{ClientConfig, WebSocketEvent, WebSocketMessage, WebSocketPlugin,
//!     WebSocketRegistryResource};
//!
//! fn main() {
//!     App::new()
//!         .add_plugins(MinimalPlugins)
//!         .add_plugins(WebSocketPlugin::new(ClientConfig::development()))
//!         .add_systems(Startup, connect)
//!         .add_systems(Update, on_event)
//!         .run();
//! }
//!
//! fn connect(registry: Res<WebSocketRegistryResource>) {
//!     let url = registry.config().websocket_url();
//!     registry.connect(url);
//! }
//!
//! fn on_event(mut messages: MessageReader<WebSocketMessage>, registry: Res<WebSocketRegistryResource>) {
//!     for WebSocketMessage(event) in messages.read() {
//!         if let WebSocketEvent::Connected { id } = event {
//!             registry.send(*id, "hello");
//!         }
//!     }
//! }
//! ```
//!
//! The [`ws`] module has no Bevy dependency and can be driven directly with
//! any [`WebSocketEventSink`].

pub mod ws;
pub mod ws_bevy;

pub use ws::{
    ClientConfig, EventChannel, PollReceiver, ReadyState, WebSocketError, WebSocketEvent,
    WebSocketEventSink, WebSocketRegistry, WsResult,
};
pub use ws_bevy::{
    WebSocketEventReceiver, WebSocketMessage, WebSocketPlugin, WebSocketRegistryResource,
};
