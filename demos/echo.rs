//! Headless echo client.
//!
//! Connects to the URL given as the first argument (default
//! `ws://127.0.0.1:9001/`), sends a ping once connected, logs everything it
//! receives and exits when the connection ends.

use bevy::app::ScheduleRunnerPlugin;
use bevy::log::LogPlugin;
use bevy::prelude::*;
use bevy_ws_registry::{
    ClientConfig, WebSocketEvent, WebSocketMessage, WebSocketPlugin, WebSocketRegistryResource,
};
use std::time::Duration;

#[derive(Resource)]
struct Target(String);

fn main() {
    let url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ws://127.0.0.1:9001/".to_string());

    App::new()
        .add_plugins(
            MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(Duration::from_millis(16))),
        )
        .add_plugins(LogPlugin::default())
        .add_plugins(WebSocketPlugin::new(ClientConfig::development()))
        .insert_resource(Target(url))
        .add_systems(Startup, connect)
        .add_systems(Update, handle_events)
        .run();
}

fn connect(
    registry: Option<Res<WebSocketRegistryResource>>,
    target: Res<Target>,
    mut exit: MessageWriter<AppExit>,
) {
    let Some(registry) = registry else {
        exit.write(AppExit::error());
        return;
    };

    let id = registry.connect(target.0.as_str());
    if id < 0 {
        exit.write(AppExit::error());
        return;
    }
    log::info!("Opened handle {} to {}", id, target.0);
}

fn handle_events(
    mut messages: MessageReader<WebSocketMessage>,
    registry: Res<WebSocketRegistryResource>,
    mut exit: MessageWriter<AppExit>,
) {
    for WebSocketMessage(event) in messages.read() {
        log::info!("{}", event.to_json());
        match event {
            WebSocketEvent::Connected { id } => {
                registry.send(*id, "ping");
            }
            WebSocketEvent::MessageReceived { id, .. } => {
                registry.disconnect(*id);
            }
            WebSocketEvent::Disconnected { .. } => {
                exit.write(AppExit::Success);
            }
            WebSocketEvent::Error { .. } => {
                exit.write(AppExit::error());
            }
            WebSocketEvent::BinaryReceived { .. } => {}
        }
    }
}
