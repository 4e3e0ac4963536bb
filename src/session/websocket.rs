//! WebSocket Session implementation
//!
//! Performs the client upgrade and exposes the framed connection as a plain
//! byte stream: writes become binary messages, reads drain message payloads.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        protocol::{Message, WebSocketConfig as TungsteniteConfig},
    },
    WebSocketStream,
};
use tracing::trace;

use crate::common::{Result, Stream};
use crate::error::Error;

use super::{Session, WebSocketConfig};

/// WebSocket session for framing streams
pub struct WebSocketSession {
    config: WebSocketConfig,
}

impl WebSocketSession {
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }

    fn build_request(&self, extra: &[(String, String)]) -> Result<Request> {
        let uri = format!("ws://{}{}", self.config.host, self.config.path);

        let mut request = Request::builder()
            .uri(&uri)
            .header("Host", &self.config.host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());

        for (key, value) in self.config.headers.iter().chain(extra) {
            if key.eq_ignore_ascii_case("host") {
                continue;
            }
            request = request.header(key.as_str(), value.as_str());
        }

        request
            .body(())
            .map_err(|e| Error::Protocol(format!("Failed to build WebSocket request: {}", e)))
    }
}

#[async_trait]
impl Session for WebSocketSession {
    async fn wrap_client(&self, stream: Stream, headers: &[(String, String)]) -> Result<Stream> {
        let request = self.build_request(headers)?;

        let ws_config = TungsteniteConfig {
            max_message_size: Some(64 << 20), // 64 MB
            max_frame_size: Some(16 << 20),   // 16 MB
            ..Default::default()
        };

        let (ws_stream, response) = client_async_with_config(request, stream, Some(ws_config))
            .await
            .map_err(|e| Error::Protocol(format!("WebSocket handshake failed: {}", e)))?;

        trace!("WebSocket: upgraded ({})", response.status());
        Ok(Box::new(WebSocketByteStream::new(ws_stream)))
    }
}

/// Byte-stream view over a WebSocket connection
struct WebSocketByteStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
}

impl<S> WebSocketByteStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
        }
    }
}

fn io_error(e: impl std::fmt::Display) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
}

impl<S> AsyncRead for WebSocketByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        loop {
            // Return buffered data first
            if self.read_pos < self.read_buf.len() {
                let remaining = &self.read_buf[self.read_pos..];
                let to_copy = remaining.len().min(buf.remaining());
                buf.put_slice(&remaining[..to_copy]);
                self.read_pos += to_copy;

                if self.read_pos >= self.read_buf.len() {
                    self.read_buf.clear();
                    self.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            if self.closed {
                return Poll::Ready(Ok(()));
            }

            let data = match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(Message::Binary(data)))) => data,
                Poll::Ready(Some(Ok(Message::Text(text)))) => text.into_bytes(),
                // tungstenite answers pings on the next write/flush
                Poll::Ready(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Poll::Ready(Some(Ok(Message::Close(frame)))) => {
                    trace!("WebSocket received close frame: {:?}", frame);
                    self.closed = true;
                    continue;
                }
                Poll::Ready(Some(Ok(Message::Frame(_)))) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "Unexpected raw frame",
                    )));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    return Poll::Ready(Err(io_error(e)));
                }
                Poll::Ready(None) => {
                    self.closed = true;
                    continue;
                }
                Poll::Pending => return Poll::Pending,
            };

            self.read_buf = data;
            self.read_pos = 0;
        }
    }
}

impl<S> AsyncWrite for WebSocketByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(io_error(e)));
            }
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(io_error(e)))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => {
                self.closed = true;
                Poll::Ready(Err(io_error(e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        // Sends a close frame and flushes it
        match Pin::new(&mut self.inner).poll_close(cx) {
            Poll::Ready(result) => {
                self.closed = true;
                Poll::Ready(result.map_err(io_error))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{Request as ServerRequest, Response};

    #[tokio::test]
    async fn test_handshake_headers_and_binary_relay() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            let mut ws = accept_hdr_async(server, |req: &ServerRequest, resp: Response| {
                for name in ["host", "user-agent", "forward-dest", "forward-proto"] {
                    let value = req
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    seen.push(value);
                }
                Ok(resp)
            })
            .await
            .unwrap();

            let msg = ws.next().await.unwrap().unwrap();
            ws.send(Message::Binary(b"pong".to_vec())).await.unwrap();
            (seen, msg)
        });

        let session = WebSocketSession::new(WebSocketConfig {
            path: "/tunnel".to_string(),
            host: "edge.example.com".to_string(),
            headers: vec![("User-Agent".to_string(), "DEV".to_string())],
        });
        let extra = vec![
            ("Forward-Dest".to_string(), "1.1.1.1:53".to_string()),
            ("Forward-Proto".to_string(), "udp".to_string()),
        ];

        let mut stream = session.wrap_client(Box::new(client), &extra).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        stream.flush().await.unwrap();

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        let (seen, msg) = server.await.unwrap();
        assert_eq!(
            seen,
            vec![
                Some("edge.example.com".to_string()),
                Some("DEV".to_string()),
                Some("1.1.1.1:53".to_string()),
                Some("udp".to_string()),
            ]
        );
        assert_eq!(msg, Message::Binary(b"ping".to_vec()));
    }

    #[tokio::test]
    async fn test_close_frame_reads_as_eof() {
        let (client, server) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(async move {
            let mut ws = tokio_tungstenite::accept_async(server).await.unwrap();
            ws.close(None).await.unwrap();
            let _ = ws.next().await;
        });

        let session = WebSocketSession::new(WebSocketConfig::default());
        let mut stream = session.wrap_client(Box::new(client), &[]).await.unwrap();

        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        drop(stream);
        server.await.unwrap();
    }
}
