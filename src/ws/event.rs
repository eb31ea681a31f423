//! Event delivery from connection tasks to the consumer.
//!
//! Every connection reports through a [`WebSocketEventSink`], invoked on the
//! runtime thread that drives that connection. Events for one handle arrive in
//! transport order; events for different handles may interleave.

use serde::Serialize;
use std::sync::mpsc;

/// Events pushed to the consumer, tagged with the handle they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WebSocketEvent {
    Connected { id: i32 },
    MessageReceived { id: i32, text: String },
    BinaryReceived { id: i32, data: Vec<u8> },
    Disconnected { id: i32, code: u16, reason: String },
    Error { id: i32, message: String },
}

impl WebSocketEvent {
    pub fn id(&self) -> i32 {
        match self {
            Self::Connected { id }
            | Self::MessageReceived { id, .. }
            | Self::BinaryReceived { id, .. }
            | Self::Disconnected { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// True for the two end-of-life events. Exactly one fires per connection.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected { .. } | Self::Error { .. })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            log::error!("Failed to serialize WebSocket event: {}", e);
            String::from("{}")
        })
    }
}

/// Consumer-supplied receiver of connection events.
///
/// Called from runtime worker threads, never from the thread that called
/// `connect`. Implementations must not block for long.
pub trait WebSocketEventSink: Send + Sync + 'static {
    /// Handshake completed; the handle is now usable for sending.
    fn on_connected(&self, id: i32);

    /// One complete inbound text message.
    fn on_message(&self, id: i32, text: String);

    /// One complete inbound binary message. Ignored unless overridden.
    fn on_binary(&self, id: i32, data: Vec<u8>) {
        let _ = (id, data);
    }

    /// Clean close. The handle is already gone from the registry.
    fn on_disconnected(&self, id: i32, code: u16, reason: String);

    /// Abnormal termination. The handle is already gone from the registry.
    fn on_error(&self, id: i32, message: String);
}

/// Anything that can take a whole [`WebSocketEvent`] at once.
///
/// Implementing this gives a [`WebSocketEventSink`] for free.
pub trait EventChannel: Send + Sync + 'static {
    fn deliver(&self, event: WebSocketEvent);
}

impl<T: EventChannel> WebSocketEventSink for T {
    fn on_connected(&self, id: i32) {
        self.deliver(WebSocketEvent::Connected { id });
    }

    fn on_message(&self, id: i32, text: String) {
        self.deliver(WebSocketEvent::MessageReceived { id, text });
    }

    fn on_binary(&self, id: i32, data: Vec<u8>) {
        self.deliver(WebSocketEvent::BinaryReceived { id, data });
    }

    fn on_disconnected(&self, id: i32, code: u16, reason: String) {
        self.deliver(WebSocketEvent::Disconnected { id, code, reason });
    }

    fn on_error(&self, id: i32, message: String) {
        self.deliver(WebSocketEvent::Error { id, message });
    }
}

impl EventChannel for mpsc::Sender<WebSocketEvent> {
    fn deliver(&self, event: WebSocketEvent) {
        let id = event.id();
        if self.send(event).is_err() {
            log::warn!("[WebSocket {}] Event receiver dropped", id);
        }
    }
}

impl EventChannel for tokio::sync::mpsc::UnboundedSender<WebSocketEvent> {
    fn deliver(&self, event: WebSocketEvent) {
        let id = event.id();
        if self.send(event).is_err() {
            log::warn!("[WebSocket {}] Event receiver dropped", id);
        }
    }
}
