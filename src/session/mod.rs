//! Session Layer
//!
//! Responsibilities:
//! - TLS encryption
//! - WebSocket framing and the upgrade handshake
//!
//! This layer transforms raw transport streams into secure/framed streams.
//! It knows nothing about flows or pooling.

mod tls;
mod tls_websocket;
mod websocket;

pub use tls::TlsSession;
pub use tls_websocket::TlsWebSocketSession;
pub use websocket::WebSocketSession;

use async_trait::async_trait;

use crate::common::{Result, Stream};
use crate::error::Error;

/// Session trait for wrapping streams with encryption/framing
///
/// `headers` are extra request headers for the handshake. Layers without a
/// request (TLS) ignore them.
#[async_trait]
pub trait Session: Send + Sync {
    /// Wrap a stream (client-side: initiate handshake)
    async fn wrap_client(&self, stream: Stream, headers: &[(String, String)]) -> Result<Stream>;
}

/// Session configuration
#[derive(Debug, Clone)]
pub enum SessionConfig {
    /// WebSocket over plain TCP
    WebSocket(WebSocketConfig),
    /// WebSocket over TLS
    TlsWebSocket(TlsConfig, WebSocketConfig),
}

impl SessionConfig {
    /// Pick the session stack for an edge URL scheme
    pub fn from_scheme(scheme: &str, tls: TlsConfig, ws: WebSocketConfig) -> Result<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "ws" => Ok(SessionConfig::WebSocket(ws)),
            "wss" => Ok(SessionConfig::TlsWebSocket(tls, ws)),
            other => Err(Error::Unsupported(format!("edge scheme: {}", other))),
        }
    }
}

/// TLS configuration
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Server name for SNI
    pub server_name: String,
    /// Allow insecure certificates
    pub allow_insecure: bool,
    /// ALPN protocols
    pub alpn: Vec<String>,
}

/// WebSocket configuration
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Request path
    pub path: String,
    /// Host header
    pub host: String,
    /// Headers sent on every handshake
    pub headers: Vec<(String, String)>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: "localhost".to_string(),
            headers: vec![],
        }
    }
}

/// Create a session from configuration
pub fn create_session(config: &SessionConfig) -> Box<dyn Session> {
    match config {
        SessionConfig::WebSocket(ws_config) => Box::new(WebSocketSession::new(ws_config.clone())),
        SessionConfig::TlsWebSocket(tls_config, ws_config) => Box::new(TlsWebSocketSession::new(
            tls_config.clone(),
            ws_config.clone(),
        )),
    }
}
