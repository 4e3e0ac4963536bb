//! Combined TLS + WebSocket Session
//!
//! This session wraps a stream with TLS first, then WebSocket framing.

use async_trait::async_trait;
use tracing::trace;

use super::{Session, TlsConfig, TlsSession, WebSocketConfig, WebSocketSession};
use crate::common::{Result, Stream};

/// Combined TLS + WebSocket session
pub struct TlsWebSocketSession {
    tls_session: TlsSession,
    ws_session: WebSocketSession,
}

impl TlsWebSocketSession {
    pub fn new(tls_config: TlsConfig, ws_config: WebSocketConfig) -> Self {
        Self {
            tls_session: TlsSession::new(tls_config),
            ws_session: WebSocketSession::new(ws_config),
        }
    }
}

#[async_trait]
impl Session for TlsWebSocketSession {
    async fn wrap_client(&self, stream: Stream, headers: &[(String, String)]) -> Result<Stream> {
        let tls_stream = self.tls_session.wrap_client(stream, headers).await?;
        trace!("TLS+WebSocket: TLS established, upgrading");
        self.ws_session.wrap_client(tls_stream, headers).await
    }
}
