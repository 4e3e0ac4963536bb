//! Argo edge connector
//!
//! Opens one WebSocket (optionally over TLS) to the edge. The TCP connection
//! can be pointed at a fixed CDN address while `Host` and SNI keep the
//! configured hostname.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use crate::common::{Address, Metadata, Result, Stream};
use crate::error::Error;
use crate::session::{create_session, Session, SessionConfig, TlsConfig, WebSocketConfig};

use super::{forwarding_headers, Connector, TcpTransport, Transport, USER_AGENT};

/// Default upgrade deadline
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Edge endpoint settings
#[derive(Debug, Clone)]
pub struct ArgoOptions {
    /// `ws` or `wss`
    pub scheme: String,
    /// `host[/path]`
    pub url: String,
    /// Connect here instead of resolving the host
    pub cdn_ip: Option<String>,
    /// Port used with `cdn_ip`
    pub port: u16,
    pub handshake_timeout: Duration,
    pub allow_insecure: bool,
    /// Bind edge sockets to this interface
    pub interface: Option<String>,
}

impl Default for ArgoOptions {
    fn default() -> Self {
        Self {
            scheme: "wss".to_string(),
            url: String::new(),
            cdn_ip: None,
            port: 443,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            allow_insecure: false,
            interface: None,
        }
    }
}

impl ArgoOptions {
    /// Hostname part of the URL
    pub fn host(&self) -> &str {
        self.url.split('/').next().unwrap_or_default()
    }

    /// Request path, always starting with `/`
    pub fn path(&self) -> String {
        match self.url.split_once('/') {
            Some((_, path)) => format!("/{}", path),
            None => "/".to_string(),
        }
    }

    /// Where the TCP connection goes
    pub fn connect_address(&self) -> Address {
        match self.cdn_ip.as_deref().filter(|ip| !ip.is_empty()) {
            Some(ip) => Address::from_host(ip, self.port),
            None => {
                let port = if self.scheme.eq_ignore_ascii_case("ws") { 80 } else { 443 };
                let (host, port) = split_host_port(self.host(), port);
                Address::from_host(host, port)
            }
        }
    }

    fn session_config(&self) -> Result<SessionConfig> {
        let (host, _) = split_host_port(self.host(), 0);
        let tls = TlsConfig {
            server_name: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            allow_insecure: self.allow_insecure,
            alpn: vec!["http/1.1".to_string()],
        };
        let ws = WebSocketConfig {
            path: self.path(),
            host: self.host().to_string(),
            headers: vec![("User-Agent".to_string(), USER_AGENT.to_string())],
        };
        SessionConfig::from_scheme(&self.scheme, tls, ws)
    }
}

/// Split an optional `:port` off a URL host
fn split_host_port(host: &str, default_port: u16) -> (&str, u16) {
    if let Some((name, port)) = host.rsplit_once(':') {
        // bare IPv6 literals contain colons too
        if !name.contains(':') || name.ends_with(']') {
            if let Ok(port) = port.parse() {
                return (name, port);
            }
        }
    }
    (host, default_port)
}

/// Connector that performs the WebSocket upgrade against the edge
pub struct ArgoConnector {
    transport: Arc<dyn Transport>,
    session: Box<dyn Session>,
    address: Address,
    host: String,
    handshake_timeout: Duration,
}

impl ArgoConnector {
    pub fn new(options: &ArgoOptions) -> Result<Self> {
        if options.host().is_empty() {
            return Err(Error::Config("argo url has no host".into()));
        }
        let transport = TcpTransport::new().with_interface(options.interface.clone());
        Ok(Self {
            transport: Arc::new(transport),
            session: create_session(&options.session_config()?),
            address: options.connect_address(),
            host: options.host().to_string(),
            handshake_timeout: options.handshake_timeout,
        })
    }

    /// Edge hostname
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP connect address
    pub fn address(&self) -> &Address {
        &self.address
    }
}

#[async_trait]
impl Connector for ArgoConnector {
    async fn connect(&self, metadata: Option<&Metadata>) -> Result<Stream> {
        let headers = metadata.map(forwarding_headers).unwrap_or_default();

        let handshake = async {
            let stream = self.transport.connect(&self.address).await?;
            self.session.wrap_client(stream, &headers).await
        };

        let stream = tokio::time::timeout(self.handshake_timeout, handshake)
            .await
            .map_err(|_| Error::Timeout)??;

        trace!(
            "[POOL] edge connection to {} via {} ({})",
            self.host,
            self.address,
            if metadata.is_some() { "addressed" } else { "blank" }
        );
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Network;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};

    fn options(url: &str) -> ArgoOptions {
        ArgoOptions {
            scheme: "ws".to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_url_parts() {
        let opts = options("edge.example.com/tunnel/ws");
        assert_eq!(opts.host(), "edge.example.com");
        assert_eq!(opts.path(), "/tunnel/ws");
        assert_eq!(opts.connect_address(), Address::domain("edge.example.com", 80));

        let bare = options("edge.example.com:8080");
        assert_eq!(bare.path(), "/");
        assert_eq!(bare.connect_address(), Address::domain("edge.example.com", 8080));
    }

    #[test]
    fn test_cdn_ip_override() {
        let opts = ArgoOptions {
            cdn_ip: Some("104.16.0.1".to_string()),
            port: 2053,
            ..options("edge.example.com")
        };
        assert_eq!(
            opts.connect_address(),
            Address::Socket("104.16.0.1:2053".parse().unwrap())
        );
        assert_eq!(opts.host(), "edge.example.com");
    }

    #[test]
    fn test_rejects_missing_host_and_bad_scheme() {
        assert!(matches!(ArgoConnector::new(&options("")), Err(Error::Config(_))));
        let opts = ArgoOptions {
            scheme: "ftp".to_string(),
            ..options("edge.example.com")
        };
        assert!(matches!(ArgoConnector::new(&opts), Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_fresh_dial_carries_forwarding_headers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..2 {
                let (socket, _) = listener.accept().await.unwrap();
                let mut headers = None;
                let mut ws = tokio_tungstenite::accept_hdr_async(socket, |req: &Request, resp: Response| {
                    let get = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    headers = Some((
                        get("host"),
                        get("user-agent"),
                        get("forward-dest"),
                        get("forward-proto"),
                        req.uri().path().to_string(),
                    ));
                    Ok(resp)
                })
                .await
                .unwrap();
                seen.push(headers.unwrap());
                let _ = ws.next().await;
            }
            seen
        });

        let connector = ArgoConnector::new(&ArgoOptions {
            cdn_ip: Some("127.0.0.1".to_string()),
            port,
            ..options("edge.example.com/tunnel")
        })
        .unwrap();

        let metadata = Metadata::new(
            Address::from_host("10.0.0.2", 40000),
            Address::from_host("93.184.216.34", 443),
            Network::Tcp,
        );
        let fresh = connector.connect(Some(&metadata)).await.unwrap();
        drop(fresh);
        let blank = connector.connect(None).await.unwrap();
        drop(blank);

        let seen = server.await.unwrap();
        let host = Some("edge.example.com".to_string());
        let agent = Some("DEV".to_string());
        assert_eq!(
            seen[0],
            (
                host.clone(),
                agent.clone(),
                Some("93.184.216.34:443".to_string()),
                Some("tcp".to_string()),
                "/tunnel".to_string()
            )
        );
        assert_eq!(seen[1], (host, agent, None, None, "/tunnel".to_string()));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // accept and never answer the upgrade
        let _server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let connector = ArgoConnector::new(&ArgoOptions {
            cdn_ip: Some("127.0.0.1".to_string()),
            port,
            handshake_timeout: Duration::from_millis(200),
            ..options("edge.example.com")
        })
        .unwrap();

        assert!(matches!(connector.connect(None).await, Err(Error::Timeout)));
    }
}
