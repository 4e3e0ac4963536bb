//! Metadata - the destination context forwarded to the remote edge
//!
//! Built from a captured flow's endpoint identity and handed to the dialer,
//! which turns it into handshake headers or an in-band preamble.

use super::Address;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Destination metadata for one dial request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    /// Where the captured packet came from (the application side)
    pub source: Address,
    /// Where the application wanted to go
    pub destination: Address,
    /// Network type (TCP/UDP)
    pub network: Network,
}

impl Metadata {
    pub fn new(source: Address, destination: Address, network: Network) -> Self {
        Self {
            source,
            destination,
            network,
        }
    }

    /// Textual destination, as sent in the `Forward-Dest` header
    pub fn destination_address(&self) -> String {
        self.destination.to_string()
    }
}
