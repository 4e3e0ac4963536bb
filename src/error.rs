//! Error types for cftun

use thiserror::Error;

/// Main error type for cftun
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Transport closed")]
    TransportClosed,

    #[error("Device closed")]
    DeviceClosed,

    #[error("Dispatcher closed")]
    DispatcherClosed,

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

/// Malformed-input conditions raised while dissecting a captured packet.
///
/// These are always recovered locally: the packet is dropped and the read
/// loop continues.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short")]
    TooShort,

    #[error("unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid IPv4 header length")]
    InvalidHeaderLength,

    #[error("IPv6 packet too short")]
    Ipv6TooShort,

    #[error("TCP packet too short")]
    TcpTooShort,

    #[error("UDP packet too short")]
    UdpTooShort,
}

impl PacketError {
    /// Short label used for drop metrics
    pub fn reason(&self) -> &'static str {
        match self {
            PacketError::TooShort => "too_short",
            PacketError::UnsupportedVersion(_) => "unsupported_version",
            PacketError::InvalidHeaderLength => "invalid_header_length",
            PacketError::Ipv6TooShort => "ipv6_too_short",
            PacketError::TcpTooShort => "tcp_too_short",
            PacketError::UdpTooShort => "udp_too_short",
        }
    }
}

/// Result type alias for cftun
pub type Result<T> = std::result::Result<T, Error>;
