//! Address type for network connections

use std::net::{IpAddr, SocketAddr};

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Build an address from a host string, preferring a literal IP when it parses
    pub fn from_host(host: &str, port: u16) -> Self {
        let trimmed = host.trim_start_matches('[').trim_end_matches(']');
        match trimmed.parse::<IpAddr>() {
            Ok(ip) => Address::ip_port(ip, port),
            Err(_) => Address::domain(host, port),
        }
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_host() {
        assert_eq!(
            Address::from_host("104.16.0.1", 443),
            Address::Socket("104.16.0.1:443".parse().unwrap())
        );
        assert_eq!(
            Address::from_host("[2606:4700::1]", 443),
            Address::Socket("[2606:4700::1]:443".parse().unwrap())
        );
        assert_eq!(
            Address::from_host("edge.example.com", 80),
            Address::domain("edge.example.com", 80)
        );
    }

    #[test]
    fn test_display_v6() {
        let addr = Address::from_host("2606:4700::1", 53);
        assert_eq!(addr.to_string(), "[2606:4700::1]:53");
        assert_eq!(addr.host(), "2606:4700::1");
    }
}
