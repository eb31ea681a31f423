//! WebSocket Bevy Plugin Implementation

use bevy::prelude::*;
use std::ops::Deref;
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use crate::ws::{ClientConfig, WebSocketEvent, WebSocketRegistry};

/// A connection event, re-delivered on the main schedule.
#[derive(Message, Debug, Clone, PartialEq, Eq)]
pub struct WebSocketMessage(pub WebSocketEvent);

/// Bevy Resource wrapper for the registry.
///
/// Systems call `connect`/`send`/`disconnect` through it; the `Arc` can be
/// cloned out for use on other threads.
#[derive(Resource, Clone)]
pub struct WebSocketRegistryResource(Arc<WebSocketRegistry>);

impl WebSocketRegistryResource {
    pub fn inner(&self) -> &Arc<WebSocketRegistry> {
        &self.0
    }
}

impl Deref for WebSocketRegistryResource {
    type Target = WebSocketRegistry;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Receiving end of the registry's event sink.
#[derive(Resource)]
pub struct WebSocketEventReceiver {
    rx: Mutex<Receiver<WebSocketEvent>>,
}

impl WebSocketEventReceiver {
    /// Try to receive the next event without blocking
    pub fn try_recv(&self) -> Option<WebSocketEvent> {
        self.rx.lock().ok()?.try_recv().ok()
    }
}

/// Bevy plugin for WebSocket client connections.
///
/// This plugin:
/// - Starts a [`WebSocketRegistry`] on its own tokio runtime
/// - Exposes it as [`WebSocketRegistryResource`]
/// - Forwards connection events as [`WebSocketMessage`]s every frame
/// - Closes every connection on [`AppExit`]
///
/// ## Usage
///
/// ```ignore
/// App::new()
///     .add_plugins(WebSocketPlugin::new(ClientConfig::development()))
///     .run();
/// ```
#[derive(Default)]
pub struct WebSocketPlugin {
    config: ClientConfig,
}

impl WebSocketPlugin {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

impl Plugin for WebSocketPlugin {
    fn build(&self, app: &mut App) {
        app.add_message::<WebSocketMessage>();

        log::info!("Starting WebSocket registry...");
        let (sender, receiver) = mpsc::channel();
        let registry = match WebSocketRegistry::new(self.config.clone(), sender) {
            Ok(registry) => registry,
            Err(e) => {
                log::error!("Failed to start WebSocket registry: {}", e);
                return;
            }
        };

        app.insert_resource(WebSocketRegistryResource(Arc::new(registry)));
        app.insert_resource(WebSocketEventReceiver {
            rx: Mutex::new(receiver),
        });

        app.add_systems(Update, forward_websocket_events)
            .add_systems(Last, disconnect_on_exit);

        log::info!("WebSocket registry configured");
    }
}

/// Drain pending connection events into Bevy messages, in arrival order.
pub fn forward_websocket_events(
    receiver: Option<Res<WebSocketEventReceiver>>,
    mut messages: MessageWriter<WebSocketMessage>,
) {
    let Some(receiver) = receiver else {
        return;
    };

    while let Some(event) = receiver.try_recv() {
        messages.write(WebSocketMessage(event));
    }
}

/// Close every connection once the app is exiting.
pub fn disconnect_on_exit(
    mut exits: MessageReader<AppExit>,
    registry: Option<Res<WebSocketRegistryResource>>,
) {
    if exits.read().next().is_none() {
        return;
    }
    if let Some(registry) = registry {
        registry.disconnect_all();
    }
}
