//! Endpoint identity of a captured flow
//!
//! Traffic read from the virtual interface is inbound to the stack, so the
//! packet's destination is the *local* side and its source the *remote* side.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use super::{Address, Metadata, Network};

/// The 4-tuple identifying a flow's two ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub local_address: IpAddr,
    pub remote_address: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
}

impl EndpointId {
    /// Build the identity from a packet's source and destination
    pub fn from_packet(src: IpAddr, src_port: u16, dst: IpAddr, dst_port: u16) -> Self {
        Self {
            local_address: dst,
            remote_address: src,
            local_port: dst_port,
            remote_port: src_port,
        }
    }

    /// The destination the application addressed
    pub fn local(&self) -> SocketAddr {
        SocketAddr::new(self.local_address, self.local_port)
    }

    /// The application socket that sent the packet
    pub fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.remote_address, self.remote_port)
    }

    /// Dial metadata for this flow
    pub fn metadata(&self, network: Network) -> Metadata {
        Metadata::new(
            Address::from(self.remote()),
            Address::from(self.local()),
            network,
        )
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.remote(), self.local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sides_follow_packet_direction() {
        let id = EndpointId::from_packet(
            "10.0.0.2".parse().unwrap(),
            40000,
            "1.1.1.1".parse().unwrap(),
            53,
        );
        assert_eq!(id.local(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(id.remote(), "10.0.0.2:40000".parse().unwrap());

        let metadata = id.metadata(Network::Udp);
        assert_eq!(metadata.destination_address(), "1.1.1.1:53");
        assert_eq!(metadata.network.to_string(), "udp");
    }
}
