//! Pull-style receive, kept for callers written against a polling API.
//!
//! Delivery in this crate is push-based through
//! [`WebSocketEventSink`](crate::ws::WebSocketEventSink). [`PollReceiver`]
//! exists so a pull-based transport can be slotted in later without touching
//! the push path.

use crate::ws::registry::WebSocketRegistry;

pub trait PollReceiver {
    /// Take the next pending text message for `id`, if the transport queues any.
    fn receive_message(&self, id: i32) -> Option<String>;
}

impl PollReceiver for WebSocketRegistry {
    /// Always `None`: messages go to the event sink as they arrive.
    ///
    /// Unknown handles also yield `None`, so "no such connection" and
    /// "nothing pending" look the same here. Use
    /// [`WebSocketRegistry::contains`] to tell them apart.
    fn receive_message(&self, id: i32) -> Option<String> {
        log::trace!("[WebSocket {}] receive_message polled (push delivery only)", id);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::ClientConfig;
    use std::sync::mpsc;

    #[test]
    fn test_receive_message_is_always_empty() {
        let (tx, _rx) = mpsc::channel();
        let registry = WebSocketRegistry::new(ClientConfig::new(), tx).unwrap();
        let id = registry.connect("ws://127.0.0.1:1/");
        assert_eq!(registry.receive_message(id), None);
        assert_eq!(registry.receive_message(9999), None);
        assert_eq!(registry.receive_message(-1), None);
    }
}
