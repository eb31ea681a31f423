//! The connection registry: small integer handles mapped to live connections.
//!
//! Handles are assigned from an atomic counter starting at 1 and are never
//! reused. The map is a sharded [`DashMap`], so work on one handle does not
//! wait on another. No call here blocks on the network: `connect` returns
//! once the task is spawned, `send` once the message is queued and
//! `disconnect` once the close is requested.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::http::header::{self, HeaderMap, HeaderName, HeaderValue};

use crate::ws::config::ClientConfig;
use crate::ws::connection::{
    ConnectionHandle, ConnectionTask, NORMAL_CLOSURE, Outbound, ReadyState,
};
use crate::ws::error::{WebSocketError, WsResult};
use crate::ws::event::WebSocketEventSink;

/// Returned by [`WebSocketRegistry::connect`] when no attempt could be started.
pub const INVALID_HANDLE: i32 = -1;
pub const DISCONNECT_REASON: &str = "client disconnect";
pub const SHUTDOWN_REASON: &str = "client shutdown";

/// Manages all WebSocket connections.
///
/// Create one per process (or per engine instance) and hand it to whatever
/// owns the engine side. Dropping it closes every connection.
pub struct WebSocketRegistry {
    connections: Arc<DashMap<i32, ConnectionHandle>>,
    next_id: AtomicI32,
    closed: AtomicBool,
    config: Arc<ClientConfig>,
    headers: Arc<HeaderMap>,
    sink: Arc<dyn WebSocketEventSink>,
    handle: Handle,
    runtime: Option<Runtime>,
    task_guard: Option<mpsc::Sender<()>>,
    tasks_done: Mutex<Option<mpsc::Receiver<()>>>,
}

impl WebSocketRegistry {
    /// Create a registry that owns its own multi-threaded runtime.
    pub fn new(config: ClientConfig, sink: impl WebSocketEventSink) -> WsResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("ws-registry")
            .build()?;
        let handle = runtime.handle().clone();
        Self::build(handle, Some(runtime), config, Arc::new(sink))
    }

    /// Create a registry that spawns its connections onto an existing runtime.
    pub fn with_handle(
        handle: Handle,
        config: ClientConfig,
        sink: impl WebSocketEventSink,
    ) -> WsResult<Self> {
        Self::build(handle, None, config, Arc::new(sink))
    }

    fn build(
        handle: Handle,
        runtime: Option<Runtime>,
        config: ClientConfig,
        sink: Arc<dyn WebSocketEventSink>,
    ) -> WsResult<Self> {
        let headers = build_headers(&config)?;
        let (task_guard, tasks_done) = mpsc::channel(1);

        Ok(Self {
            connections: Arc::new(DashMap::new()),
            next_id: AtomicI32::new(1),
            closed: AtomicBool::new(false),
            config: Arc::new(config),
            headers: Arc::new(headers),
            sink,
            handle,
            runtime,
            task_guard: Some(task_guard),
            tasks_done: Mutex::new(Some(tasks_done)),
        })
    }

    /// The config every connection in this registry uses.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Start connecting to `url` and return its handle immediately.
    ///
    /// A handle only means the attempt started. The outcome arrives later as
    /// exactly one of `on_connected` or `on_error`. URLs are not validated
    /// here; a malformed one shows up as an error event.
    pub fn try_connect(&self, url: impl Into<String>) -> WsResult<i32> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WebSocketError::RegistryClosed);
        }
        let Some(task_guard) = self.task_guard.clone() else {
            return Err(WebSocketError::RegistryClosed);
        };

        let id = self.allocate_id()?;
        let url = url.into();
        let (sender, outbound) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));

        self.connections
            .insert(id, ConnectionHandle::new(sender, state.clone()));

        let task = ConnectionTask {
            id,
            url,
            config: self.config.clone(),
            headers: self.headers.clone(),
            state,
            outbound,
            sink: self.sink.clone(),
            connections: self.connections.clone(),
            _task_guard: task_guard,
        };
        self.handle.spawn(task.run());

        Ok(id)
    }

    /// [`try_connect`](Self::try_connect) returning [`INVALID_HANDLE`] on failure.
    pub fn connect(&self, url: impl Into<String>) -> i32 {
        let url = url.into();
        match self.try_connect(url.as_str()) {
            Ok(id) => id,
            Err(e) => {
                log::error!("[WebSocket] Failed to start connection to {}: {}", url, e);
                INVALID_HANDLE
            }
        }
    }

    /// Close `id` with a normal closure and forget it. Unknown handles are ignored.
    pub fn disconnect(&self, id: i32) {
        self.disconnect_with(id, NORMAL_CLOSURE, DISCONNECT_REASON);
    }

    /// Like [`disconnect`](Self::disconnect) with an explicit close code and reason.
    ///
    /// The entry is removed right away; the close handshake finishes in the
    /// background and reports through the sink. Reserved codes (1005, 1006,
    /// 1015, ...) become a normal closure and the reason is cut to
    /// [`MAX_CLOSE_REASON_BYTES`](crate::ws::MAX_CLOSE_REASON_BYTES).
    pub fn disconnect_with(&self, id: i32, code: u16, reason: &str) {
        let Some((_, handle)) = self.connections.remove(&id) else {
            log::debug!("[WebSocket {}] disconnect: no such connection", id);
            return;
        };

        log::info!("[WebSocket {}] Disconnecting", id);
        if let Err(e) = handle.request_close(id, code, reason) {
            log::warn!("[WebSocket {}] Close request failed: {}", id, e);
        }
    }

    /// Queue a text message on `id`.
    ///
    /// `Ok` means the message was accepted into the local send queue, not
    /// that it was delivered.
    pub fn try_send(&self, id: i32, message: impl Into<String>) -> WsResult<()> {
        let message = message.into();
        self.check_size(message.len())?;
        self.lookup(id)?.enqueue(id, Outbound::Text(message))
    }

    /// [`try_send`](Self::try_send) reporting success as a bool.
    pub fn send(&self, id: i32, message: impl Into<String>) -> bool {
        let message = message.into();
        log::debug!("[WebSocket {}] send ({} bytes)", id, message.len());
        self.report_send(id, self.try_send(id, message))
    }

    /// Queue a binary message on `id`.
    pub fn try_send_binary(&self, id: i32, data: impl Into<Vec<u8>>) -> WsResult<()> {
        let data = data.into();
        self.check_size(data.len())?;
        self.lookup(id)?.enqueue(id, Outbound::Binary(data))
    }

    /// [`try_send_binary`](Self::try_send_binary) reporting success as a bool.
    pub fn send_binary(&self, id: i32, data: impl Into<Vec<u8>>) -> bool {
        self.report_send(id, self.try_send_binary(id, data))
    }

    /// Close every connection and empty the registry.
    ///
    /// A failed close is logged and skipped; the registry is empty afterwards
    /// regardless.
    pub fn disconnect_all(&self) {
        let ids: Vec<i32> = self.connections.iter().map(|entry| *entry.key()).collect();
        if !ids.is_empty() {
            log::info!("Disconnecting all WebSockets ({} open)", ids.len());
        }

        for id in ids {
            if let Some((_, handle)) = self.connections.remove(&id) {
                if let Err(e) = handle.request_close(id, NORMAL_CLOSURE, SHUTDOWN_REASON) {
                    log::warn!("[WebSocket {}] Close request failed: {}", id, e);
                }
            }
        }

        // Dropping a handle also closes its connection.
        self.connections.clear();
    }

    /// Close everything and refuse further connects.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::info!("Shutting down WebSocket registry");
        }
        self.disconnect_all();
    }

    /// [`ReadyState::Closed`] for handles the registry does not know.
    pub fn ready_state(&self, id: i32) -> ReadyState {
        self.connections
            .get(&id)
            .map(|handle| handle.ready_state())
            .unwrap_or(ReadyState::Closed)
    }

    /// Whether `id` is still tracked (not disconnected, not terminated).
    pub fn contains(&self, id: i32) -> bool {
        self.connections.contains_key(&id)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// True when no connections are tracked.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Live handles, in no particular order.
    pub fn handles(&self) -> Vec<i32> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// True once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn allocate_id(&self) -> WsResult<i32> {
        self.next_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| id.checked_add(1))
            .map_err(|_| WebSocketError::HandleSpaceExhausted)
    }

    /// Clone the handle out so the shard lock is released before sending.
    fn lookup(&self, id: i32) -> WsResult<ConnectionHandle> {
        self.connections
            .get(&id)
            .map(|handle| handle.clone())
            .ok_or(WebSocketError::UnknownHandle(id))
    }

    fn check_size(&self, size: usize) -> WsResult<()> {
        let max = self.config.max_message_size;
        if size > max {
            return Err(WebSocketError::MessageTooLarge { size, max });
        }
        Ok(())
    }

    fn report_send(&self, id: i32, result: WsResult<()>) -> bool {
        match result {
            Ok(()) => true,
            Err(WebSocketError::UnknownHandle(_)) => {
                log::warn!("[WebSocket {}] send: no such connection", id);
                false
            }
            Err(e) => {
                log::error!("[WebSocket {}] send error: {}", id, e);
                false
            }
        }
    }
}

impl Drop for WebSocketRegistry {
    fn drop(&mut self) {
        self.shutdown();
        self.task_guard.take();

        let Some(runtime) = self.runtime.take() else {
            return;
        };

        // Give connection tasks a chance to finish their close handshakes.
        // Blocking is not allowed inside another runtime, so skip the wait there.
        let tasks_done = self.tasks_done.get_mut().ok().and_then(|rx| rx.take());
        if let (Some(mut tasks_done), Err(_)) = (tasks_done, Handle::try_current()) {
            let grace = self.config.close_timeout();
            runtime.block_on(async {
                let _ = tokio::time::timeout(grace, tasks_done.recv()).await;
            });
        }
        runtime.shutdown_background();
    }
}

fn build_headers(config: &ClientConfig) -> WsResult<HeaderMap> {
    let mut headers = HeaderMap::new();

    let mut insert = |name: &str, value: &str| -> WsResult<()> {
        let invalid = |reason: String| WebSocketError::InvalidHeader {
            name: name.to_string(),
            reason,
        };
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
        headers.insert(header_name, header_value);
        Ok(())
    };

    if !config.user_agent.is_empty() {
        insert(header::USER_AGENT.as_str(), &config.user_agent)?;
    }
    if !config.subprotocols.is_empty() {
        insert(
            header::SEC_WEBSOCKET_PROTOCOL.as_str(),
            &config.subprotocols.join(", "),
        )?;
    }
    for (name, value) in &config.headers {
        insert(name, value)?;
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::event::WebSocketEvent;
    use std::sync::mpsc as std_mpsc;

    fn registry() -> (WebSocketRegistry, std_mpsc::Receiver<WebSocketEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let registry = WebSocketRegistry::new(ClientConfig::test().with_worker_threads(1), tx)
            .expect("registry");
        (registry, rx)
    }

    #[test]
    fn test_unknown_handles_are_benign() {
        let (registry, _rx) = registry();
        assert!(!registry.send(42, "hello"));
        assert!(!registry.send_binary(42, vec![1u8, 2, 3]));
        assert!(matches!(
            registry.try_send(42, "hello"),
            Err(WebSocketError::UnknownHandle(42))
        ));
        registry.disconnect(42);
        assert_eq!(registry.ready_state(42), ReadyState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handles_are_unique_and_positive() {
        let (registry, _rx) = registry();
        // Nothing listens on port 1; the attempt still yields a handle.
        let a = registry.connect("ws://127.0.0.1:1/");
        let b = registry.connect("not even a url");
        registry.disconnect(a);
        let c = registry.connect("ws://127.0.0.1:1/");
        assert!(a >= 1 && b >= 1 && c >= 1);
        assert!(a != b && b != c && a != c);
    }

    #[test]
    fn test_connect_after_shutdown_returns_sentinel() {
        let (registry, _rx) = registry();
        registry.shutdown();
        assert!(registry.is_shut_down());
        assert_eq!(registry.connect("ws://127.0.0.1:1/"), INVALID_HANDLE);
        assert!(matches!(
            registry.try_connect("ws://127.0.0.1:1/"),
            Err(WebSocketError::RegistryClosed)
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_handle_space_exhaustion() {
        let (registry, _rx) = registry();
        registry.next_id.store(i32::MAX, Ordering::SeqCst);
        assert_eq!(registry.connect("ws://127.0.0.1:1/"), INVALID_HANDLE);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (tx, _rx) = std_mpsc::channel();
        let registry =
            WebSocketRegistry::new(ClientConfig::new().with_max_message_size(4), tx).unwrap();
        let id = registry.connect("ws://127.0.0.1:1/");
        assert!(matches!(
            registry.try_send(id, "too long"),
            Err(WebSocketError::MessageTooLarge { size: 8, max: 4 })
        ));
    }

    #[test]
    fn test_disconnect_all_empties_registry() {
        let (registry, _rx) = registry();
        for _ in 0..5 {
            registry.connect("ws://127.0.0.1:1/");
        }
        registry.disconnect_all();
        assert!(registry.is_empty());
        assert!(registry.handles().is_empty());
        // Still usable afterwards, unlike shutdown.
        assert!(registry.connect("ws://127.0.0.1:1/") > 0);
    }

    fn handle_with_queue(state: ReadyState) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx, Arc::new(AtomicU8::new(state as u8)));
        (handle, rx)
    }

    #[test]
    fn test_disconnect_all_empties_registry_when_every_close_fails() {
        let (registry, _rx) = registry();
        for id in 1..=3 {
            let (handle, rx) = handle_with_queue(ReadyState::Open);
            drop(rx);
            assert!(matches!(
                handle.request_close(id, NORMAL_CLOSURE, SHUTDOWN_REASON),
                Err(WebSocketError::QueueClosed(_))
            ));
            registry.connections.insert(id, handle);
        }
        assert_eq!(registry.len(), 3);

        registry.disconnect_all();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn test_disconnect_unknown_leaves_others_alone() {
        let (registry, _rx) = registry();
        let (handle, mut outbound) = handle_with_queue(ReadyState::Open);
        registry.connections.insert(7, handle);

        registry.disconnect(99);

        assert!(registry.contains(7));
        assert_eq!(registry.ready_state(7), ReadyState::Open);
        assert!(outbound.try_recv().is_err());
        assert!(registry.send(7, "still here"));
        assert!(matches!(outbound.try_recv(), Ok(Outbound::Text(t)) if t == "still here"));
    }

    #[test]
    fn test_invalid_header_fails_construction() {
        let (tx, _rx) = std_mpsc::channel();
        let config = ClientConfig::new().with_header("bad header", "x");
        assert!(matches!(
            WebSocketRegistry::new(config, tx),
            Err(WebSocketError::InvalidHeader { .. })
        ));

        let (tx, _rx) = std_mpsc::channel();
        let config = ClientConfig::new().with_user_agent("line\nbreak");
        assert!(WebSocketRegistry::new(config, tx).is_err());
    }

    #[test]
    fn test_build_headers() {
        let config = ClientConfig::new()
            .with_user_agent("game/1.0")
            .with_subprotocol("chat")
            .with_subprotocol("v2")
            .with_header("X-Session", "abc");
        let headers = build_headers(&config).unwrap();
        assert_eq!(headers[header::USER_AGENT], "game/1.0");
        assert_eq!(headers[header::SEC_WEBSOCKET_PROTOCOL], "chat, v2");
        assert_eq!(headers["x-session"], "abc");
    }

    #[test]
    fn test_refused_connection_reports_error_once() {
        let (registry, rx) = registry();
        let id = registry.connect("ws://127.0.0.1:1/");
        let event = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("terminal event");
        assert!(matches!(event, WebSocketEvent::Error { id: got, .. } if got == id));
        assert!(!registry.contains(id));
        assert!(!registry.send(id, "x"));
        assert!(rx.recv_timeout(std::time::Duration::from_millis(200)).is_err());
    }
}
