//! TCP Transport implementation

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tracing::trace;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::Transport;

/// TCP transport - raw TCP connections
///
/// Optionally pins outbound sockets to a network interface so edge traffic
/// bypasses the TUN route.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    interface: Option<String>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind every outbound socket to `interface`
    pub fn with_interface(mut self, interface: Option<String>) -> Self {
        self.interface = interface.filter(|name| !name.is_empty());
        self
    }

    async fn resolve(addr: &Address) -> Result<Vec<SocketAddr>> {
        match addr {
            Address::Socket(socket_addr) => Ok(vec![*socket_addr]),
            Address::Domain(domain, port) => {
                let addrs: Vec<SocketAddr> = lookup_host((domain.as_str(), *port)).await?.collect();
                if addrs.is_empty() {
                    return Err(Error::Transport(format!("No address found for {}", domain)));
                }
                Ok(addrs)
            }
        }
    }

    async fn connect_one(&self, addr: SocketAddr) -> Result<TcpStream> {
        let Some(interface) = &self.interface else {
            return Ok(TcpStream::connect(addr).await?);
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        bind_interface(&socket, interface)?;
        Ok(socket.connect(addr).await?)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_interface(socket: &TcpSocket, interface: &str) -> Result<()> {
    socket
        .bind_device(Some(interface.as_bytes()))
        .map_err(|e| Error::Transport(format!("Failed to bind to interface {}: {}", interface, e)))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_interface(_socket: &TcpSocket, interface: &str) -> Result<()> {
    Err(Error::Unsupported(format!(
        "binding to interface {} on this platform",
        interface
    )))
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        let mut last_err = None;

        for candidate in Self::resolve(addr).await? {
            match self.connect_one(candidate).await {
                Ok(stream) => {
                    // Disable Nagle's algorithm for lower latency
                    stream.set_nodelay(true)?;
                    trace!("TCP connected to {} ({})", addr, candidate);
                    return Ok(Box::new(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Transport(format!("Cannot connect to {}", addr))))
    }
}
