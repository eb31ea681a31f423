//! Client configuration shared by every connection in a registry.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::ws::error::WsResult;

const FALLBACK_URL: &str = "ws://localhost:7901";

/// Settings applied to every connection opened through a registry.
///
/// Can be built in code with the `with_*` methods or loaded from JSON, in
/// which case missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub ws_path: String,
    pub api_version: String,
    pub user_agent: String,
    pub headers: BTreeMap<String, String>,
    pub subprotocols: Vec<String>,
    pub max_message_size: usize,
    /// Handshake deadline. `None` waits for the transport indefinitely.
    pub connect_timeout_ms: Option<u64>,
    /// How long to wait for the peer's close reply after a local close.
    pub close_timeout_ms: u64,
    pub enable_message_logging: bool,
    /// Worker threads for a registry that owns its runtime.
    pub worker_threads: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:7901".to_string(),
            ws_path: "ws".to_string(),
            api_version: "v1".to_string(),
            user_agent: concat!("bevy-ws-registry/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: BTreeMap::new(),
            subprotocols: Vec::new(),
            max_message_size: 64 * 1024,
            connect_timeout_ms: None,
            close_timeout_ms: 5_000,
            enable_message_logging: true,
            worker_threads: 2,
        }
    }
}

impl ClientConfig {
    /// Same as [`Default`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Local development server, small messages, chatty logs.
    pub fn development() -> Self {
        Self {
            base_url: "http://localhost:7901".to_string(),
            max_message_size: 32 * 1024,
            connect_timeout_ms: Some(10_000),
            close_timeout_ms: 2_000,
            enable_message_logging: true,
            ..Self::default()
        }
    }

    /// Longer timeouts, payload logging off.
    pub fn production() -> Self {
        Self {
            max_message_size: 64 * 1024,
            connect_timeout_ms: Some(30_000),
            close_timeout_ms: 5_000,
            enable_message_logging: false,
            ..Self::default()
        }
    }

    /// Settings for a shared test server.
    pub fn test() -> Self {
        Self {
            max_message_size: 32 * 1024,
            connect_timeout_ms: Some(15_000),
            close_timeout_ms: 3_000,
            enable_message_logging: true,
            ..Self::default()
        }
    }

    /// Parse a JSON document into a config.
    pub fn from_json(json: &str) -> WsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// HTTP(S) or WS(S) server root; http is turned into ws when building URLs.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Path appended to the base URL.
    pub fn with_ws_path(mut self, ws_path: impl Into<String>) -> Self {
        self.ws_path = ws_path.into();
        self
    }

    /// Version segment used by [`websocket_url_with_version`](Self::websocket_url_with_version).
    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    /// `User-Agent` sent with the handshake. Empty sends none.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Extra handshake header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Add a `Sec-WebSocket-Protocol` entry.
    pub fn with_subprotocol(mut self, protocol: impl Into<String>) -> Self {
        self.subprotocols.push(protocol.into());
        self
    }

    /// Largest message accepted in either direction.
    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Give up on handshakes that take longer than `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = Some(duration_millis(timeout));
        self
    }

    /// How long to wait for the peer's close reply.
    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout_ms = duration_millis(timeout);
        self
    }

    /// Include payload previews in debug logs.
    pub fn with_message_logging(mut self, enabled: bool) -> Self {
        self.enable_message_logging = enabled;
        self
    }

    /// Worker threads for an owned runtime, at least one.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// [`connect_timeout_ms`](Self::connect_timeout_ms) as a `Duration`.
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// [`close_timeout_ms`](Self::close_timeout_ms) as a `Duration`.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// `base_url` with `http`/`https` swapped for `ws`/`wss`, joined with `ws_path`.
    pub fn websocket_url(&self) -> String {
        join_url(&self.ws_base_url(), &[&self.ws_path])
    }

    /// Like [`websocket_url`](Self::websocket_url) with `/api/<version>` inserted.
    pub fn websocket_url_with_version(&self) -> String {
        join_url(&self.ws_base_url(), &["api", &self.api_version, &self.ws_path])
    }

    /// Versioned URL carrying a `sessionId` query parameter.
    pub fn websocket_url_with_session(&self, session_id: &str) -> String {
        let base = self.websocket_url_with_version();
        match url::Url::parse(&base) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("sessionId", session_id);
                url.to_string()
            }
            Err(_) => format!("{}?sessionId={}", base, session_id),
        }
    }

    fn ws_base_url(&self) -> String {
        let Ok(mut url) = url::Url::parse(&self.base_url) else {
            log::error!("Invalid base URL '{}', using {}", self.base_url, FALLBACK_URL);
            return FALLBACK_URL.to_string();
        };

        let scheme = match url.scheme() {
            "http" => Some("ws"),
            "https" => Some("wss"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            if url.set_scheme(scheme).is_err() {
                log::error!("Cannot convert '{}' to a WebSocket URL", self.base_url);
                return FALLBACK_URL.to_string();
            }
        }

        url.to_string()
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn join_url(base: &str, segments: &[&str]) -> String {
    let mut joined = base.trim_end_matches('/').to_string();
    for segment in segments {
        let segment = segment.trim_matches('/');
        if !segment.is_empty() {
            joined.push('/');
            joined.push_str(segment);
        }
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_converts_scheme() {
        let config = ClientConfig::new().with_base_url("http://example.com:7900");
        assert_eq!(config.websocket_url(), "ws://example.com:7900/ws");

        let config = ClientConfig::new().with_base_url("https://example.com/");
        assert_eq!(config.websocket_url(), "wss://example.com/ws");

        let config = ClientConfig::new().with_base_url("ws://already.ws:1234");
        assert_eq!(config.websocket_url(), "ws://already.ws:1234/ws");
    }

    #[test]
    fn test_websocket_url_with_version_and_session() {
        let config = ClientConfig::new()
            .with_base_url("http://localhost:7901")
            .with_ws_path("/chat/")
            .with_api_version("v2");
        assert_eq!(
            config.websocket_url_with_version(),
            "ws://localhost:7901/api/v2/chat"
        );
        assert_eq!(
            config.websocket_url_with_session("abc 1"),
            "ws://localhost:7901/api/v2/chat?sessionId=abc+1"
        );
    }

    #[test]
    fn test_invalid_base_url_falls_back() {
        let config = ClientConfig::new().with_base_url("not a url");
        assert_eq!(config.websocket_url(), "ws://localhost:7901/ws");
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = ClientConfig::from_json(
            r#"{ "base_url": "https://game.example", "connect_timeout_ms": 2500 }"#,
        )
        .unwrap();
        assert_eq!(config.base_url, "https://game.example");
        assert_eq!(config.connect_timeout(), Some(Duration::from_millis(2500)));
        assert_eq!(config.max_message_size, 64 * 1024);
        assert_eq!(config.ws_path, "ws");

        assert!(ClientConfig::from_json("{ nope").is_err());
    }

    #[test]
    fn test_huge_timeouts_saturate() {
        let config = ClientConfig::new()
            .with_connect_timeout(Duration::MAX)
            .with_close_timeout(Duration::MAX);
        assert_eq!(config.connect_timeout_ms, Some(u64::MAX));
        assert_eq!(config.close_timeout_ms, u64::MAX);

        let config = ClientConfig::new().with_close_timeout(Duration::from_millis(1500));
        assert_eq!(config.close_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn test_presets() {
        assert!(!ClientConfig::production().enable_message_logging);
        assert_eq!(ClientConfig::development().max_message_size, 32 * 1024);
        assert_eq!(ClientConfig::test().close_timeout(), Duration::from_secs(3));
        assert_eq!(ClientConfig::new().connect_timeout(), None);
    }
}
