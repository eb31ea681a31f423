//! A single WebSocket connection.
//!
//! Each connection is driven by one task on the registry's runtime. The task
//! owns the socket; the registry only keeps a [`ConnectionHandle`] holding the
//! outbound queue and the shared ready state.

use dashmap::DashMap;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::ws::config::ClientConfig;
use crate::ws::error::{WebSocketError, WsResult};
use crate::ws::event::WebSocketEventSink;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Normal closure (RFC 6455 §7.4.1).
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the peer's close frame carried no status code.
const NO_STATUS_RECEIVED: u16 = 1005;
/// Control frame payloads are capped at 125 bytes, two of which hold the code.
pub const MAX_CLOSE_REASON_BYTES: usize = 123;

/// Connection lifecycle, numbered like the browser `WebSocket.readyState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Work queued for the connection task, processed strictly in order.
#[derive(Debug)]
pub(crate) enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// The registry's view of a connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    sender: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

impl ConnectionHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<Outbound>, state: Arc<AtomicU8>) -> Self {
        Self { sender, state }
    }

    pub(crate) fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Queue a message. Allowed while connecting; the task flushes the queue
    /// once the handshake completes.
    pub(crate) fn enqueue(&self, id: i32, message: Outbound) -> WsResult<()> {
        match self.ready_state() {
            ReadyState::Connecting | ReadyState::Open => self
                .sender
                .send(message)
                .map_err(|_| WebSocketError::QueueClosed(id)),
            ReadyState::Closing | ReadyState::Closed => Err(WebSocketError::NotWritable(id)),
        }
    }

    /// Ask the task to close. Messages queued earlier are still sent first.
    ///
    /// Codes that may not be sent are replaced with [`NORMAL_CLOSURE`] and the
    /// reason is cut to fit in a control frame.
    pub(crate) fn request_close(&self, id: i32, code: u16, reason: &str) -> WsResult<()> {
        let (code, reason) = sendable_close(id, code, reason);
        let _ = self.state.compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        let _ = self.state.compare_exchange(
            ReadyState::Open as u8,
            ReadyState::Closing as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.sender
            .send(Outbound::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| WebSocketError::QueueClosed(id))
    }
}

/// How a connection ended. Exactly one is produced per task.
#[derive(Debug)]
enum Termination {
    Closed { code: u16, reason: String },
    Failed(String),
}

pub(crate) struct ConnectionTask {
    pub(crate) id: i32,
    pub(crate) url: String,
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) headers: Arc<HeaderMap>,
    pub(crate) state: Arc<AtomicU8>,
    pub(crate) outbound: mpsc::UnboundedReceiver<Outbound>,
    pub(crate) sink: Arc<dyn WebSocketEventSink>,
    pub(crate) connections: Arc<DashMap<i32, ConnectionHandle>>,
    /// Held until the task exits so an owning registry can wait for it.
    pub(crate) _task_guard: mpsc::Sender<()>,
}

impl ConnectionTask {
    pub(crate) async fn run(mut self) {
        log::info!("[WebSocket {}] Connecting to {}", self.id, self.url);

        let termination = self.drive().await;

        self.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        self.connections.remove(&self.id);

        match termination {
            Termination::Closed { code, reason } => {
                log::info!("[WebSocket {}] Closed: {} {}", self.id, code, reason);
                self.sink.on_disconnected(self.id, code, reason);
            }
            Termination::Failed(message) => {
                log::error!("[WebSocket {}] {}", self.id, message);
                self.sink.on_error(self.id, message);
            }
        }
    }

    async fn drive(&mut self) -> Termination {
        let stream = match self.handshake().await {
            Ok(stream) => stream,
            Err(message) => return Termination::Failed(message),
        };

        // A close requested mid-handshake leaves the state at Closing.
        let _ = self.state.compare_exchange(
            ReadyState::Connecting as u8,
            ReadyState::Open as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.sink.on_connected(self.id);

        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                command = self.outbound.recv() => {
                    let (code, reason) = match command {
                        Some(Outbound::Text(text)) => {
                            self.log_payload("Sending", &text);
                            if let Err(e) = write.send(Message::Text(text.into())).await {
                                return Termination::Failed(format!("Send failed: {}", e));
                            }
                            continue;
                        }
                        Some(Outbound::Binary(data)) => {
                            log::debug!("[WebSocket {}] Sending binary ({} bytes)", self.id, data.len());
                            if let Err(e) = write.send(Message::Binary(data.into())).await {
                                return Termination::Failed(format!("Send failed: {}", e));
                            }
                            continue;
                        }
                        Some(Outbound::Close { code, reason }) => (code, reason),
                        // Every handle is gone, so nobody can talk to this socket again.
                        None => (NORMAL_CLOSURE, crate::ws::registry::SHUTDOWN_REASON.to_string()),
                    };
                    return self.close(write, read, code, reason).await;
                }
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Close(frame))) => {
                            let (code, reason) = close_parts(frame, NO_STATUS_RECEIVED, "");
                            log::info!("[WebSocket {}] Received close: {} {}", self.id, code, reason);
                            self.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
                            // Flushes the close reply queued by the transport.
                            let _ = write.close().await;
                            return Termination::Closed { code, reason };
                        }
                        Some(Ok(message)) => self.deliver(message),
                        Some(Err(e)) => return Termination::Failed(format!("Connection error: {}", e)),
                        None => return Termination::Failed("Connection lost".to_string()),
                    }
                }
            }
        }
    }

    async fn handshake(&self) -> Result<WsStream, String> {
        let url = url::Url::parse(&self.url).map_err(|e| format!("Invalid URL: {}", e))?;

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| format!("Invalid request: {}", e))?;
        for (name, value) in self.headers.iter() {
            request.headers_mut().insert(name.clone(), value.clone());
        }

        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(self.config.max_message_size))
            .max_frame_size(Some(self.config.max_message_size));

        log::info!("[WebSocket {}] Performing WebSocket handshake", self.id);
        let connect = tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false);
        let result = match self.config.connect_timeout() {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| format!("Connect timed out after {:?}", limit))?,
            None => connect.await,
        };

        let (stream, response) = result.map_err(|e| format!("Handshake failed: {}", e))?;
        log::info!(
            "[WebSocket {}] Connected successfully (status: {})",
            self.id,
            response.status()
        );
        Ok(stream)
    }

    /// Send our close frame and wait for the peer to answer.
    async fn close(
        &self,
        mut write: WsWriter,
        mut read: WsReader,
        code: u16,
        reason: String,
    ) -> Termination {
        self.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
        log::info!("[WebSocket {}] Closing: {} {}", self.id, code, reason);

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.clone().into(),
        };
        if let Err(e) = write.send(Message::Close(Some(frame))).await {
            return Termination::Failed(format!("Close failed: {}", e));
        }

        let handshake = async {
            while let Some(incoming) = read.next().await {
                match incoming {
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = close_parts(frame, code, &reason);
                        return Termination::Closed { code, reason };
                    }
                    Ok(message) => self.deliver(message),
                    Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => break,
                    Err(e) => return Termination::Failed(format!("Connection error: {}", e)),
                }
            }
            Termination::Closed {
                code,
                reason: reason.clone(),
            }
        };

        match tokio::time::timeout(self.config.close_timeout(), handshake).await {
            Ok(termination) => termination,
            Err(_) => Termination::Failed("Close handshake timed out".to_string()),
        }
    }

    fn deliver(&self, message: Message) {
        match message {
            Message::Text(text) => {
                self.log_payload("Received", text.as_str());
                self.sink.on_message(self.id, text.as_str().to_owned());
            }
            Message::Binary(data) => {
                log::debug!("[WebSocket {}] Received binary ({} bytes)", self.id, data.len());
                self.sink.on_binary(self.id, data.to_vec());
            }
            // Pings are answered by tungstenite
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(_) => {}
        }
    }

    fn log_payload(&self, direction: &str, text: &str) {
        if self.config.enable_message_logging {
            log::debug!("[WebSocket {}] {}: {}", self.id, direction, preview(text, 100));
        } else {
            log::debug!("[WebSocket {}] {} {} bytes", self.id, direction, text.len());
        }
    }
}

fn close_parts(frame: Option<CloseFrame>, default_code: u16, default_reason: &str) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.as_str().to_owned()))
        .unwrap_or_else(|| (default_code, default_reason.to_string()))
}

/// Close code and reason as they may go on the wire.
fn sendable_close(id: i32, code: u16, reason: &str) -> (u16, &str) {
    let code = if is_sendable_close_code(code) {
        code
    } else {
        log::warn!("[WebSocket {}] Close code {} may not be sent, using {}", id, code, NORMAL_CLOSURE);
        NORMAL_CLOSURE
    };
    (code, truncate_bytes(reason, MAX_CLOSE_REASON_BYTES))
}

/// RFC 6455 §7.4: 1004-1006 and 1015 are reserved; 1014 and 1016-2999 are
/// rejected by tungstenite peers.
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1013 | 3000..=4999)
}

/// Longest prefix of `text` that fits in `max_bytes` without splitting a char.
fn truncate_bytes(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// At most `max_chars` characters of `text`.
fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));
        (ConnectionHandle::new(tx, state), rx)
    }

    #[test]
    fn test_enqueue_while_connecting() {
        let (handle, mut rx) = handle();
        handle.enqueue(1, Outbound::Text("early".into())).unwrap();
        assert!(matches!(rx.try_recv(), Ok(Outbound::Text(t)) if t == "early"));
    }

    #[test]
    fn test_close_request_blocks_further_sends() {
        let (handle, mut rx) = handle();
        handle.request_close(1, NORMAL_CLOSURE, "client disconnect").unwrap();
        assert_eq!(handle.ready_state(), ReadyState::Closing);
        assert!(matches!(
            handle.enqueue(1, Outbound::Text("late".into())),
            Err(WebSocketError::NotWritable(1))
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(Outbound::Close { code: 1000, reason }) if reason == "client disconnect"
        ));
    }

    #[test]
    fn test_enqueue_after_task_exit() {
        let (handle, rx) = handle();
        drop(rx);
        assert!(matches!(
            handle.enqueue(4, Outbound::Binary(vec![1, 2])),
            Err(WebSocketError::QueueClosed(4))
        ));
    }

    #[test]
    fn test_close_on_closed_connection_keeps_state() {
        let (handle, _rx) = handle();
        handle.state.store(ReadyState::Closed as u8, Ordering::SeqCst);
        let _ = handle.request_close(1, NORMAL_CLOSURE, "bye");
        assert_eq!(handle.ready_state(), ReadyState::Closed);
    }

    #[test]
    fn test_close_code_and_reason_made_sendable() {
        assert_eq!(sendable_close(1, 1001, "going away"), (1001, "going away"));
        assert_eq!(sendable_close(1, 4000, ""), (4000, ""));
        for reserved in [0, 999, 1004, 1005, 1006, 1015, 2000, 5000] {
            assert_eq!(sendable_close(1, reserved, "x").0, NORMAL_CLOSURE);
        }

        let long = "x".repeat(300);
        assert_eq!(sendable_close(1, 1000, &long).1.len(), MAX_CLOSE_REASON_BYTES);

        // 'é' is two bytes; 62 of them straddle the limit.
        let accented = "é".repeat(62);
        let (_, cut) = sendable_close(1, 1000, &accented);
        assert_eq!(cut.len(), 122);
        assert_eq!(cut.chars().count(), 61);
    }

    #[test]
    fn test_request_close_sanitizes_queued_frame() {
        let (handle, mut rx) = handle();
        handle.request_close(2, 1006, &"r".repeat(200)).unwrap();
        match rx.try_recv() {
            Ok(Outbound::Close { code, reason }) => {
                assert_eq!(code, NORMAL_CLOSURE);
                assert_eq!(reason.len(), MAX_CLOSE_REASON_BYTES);
            }
            other => panic!("expected close, got {:?}", other),
        }
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo", 2), "hé");
        assert_eq!(preview("short", 100), "short");
    }

    #[test]
    fn test_close_parts() {
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "server restart".into(),
        };
        assert_eq!(
            close_parts(Some(frame), NORMAL_CLOSURE, ""),
            (1001, "server restart".to_string())
        );
        assert_eq!(close_parts(None, 1000, "x"), (1000, "x".to_string()));
    }
}
