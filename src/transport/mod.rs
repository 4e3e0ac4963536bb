//! Transport Layer
//!
//! Responsibilities:
//! - Establish connections to the remote edge
//! - Keep a pool of pre-established connections warm
//! - Carry per-request destination metadata
//!
//! The [`Dialer`] trait is what the flow dispatcher sees. The pooled
//! implementation hides connect latency behind pre-dialed connections and
//! reports whether the destination already went out with the handshake.

mod argo;
mod pool;
mod tcp;

pub use argo::{ArgoConnector, ArgoOptions};
pub use pool::{Connector, PoolStats, PooledDialer};
pub use tcp::TcpTransport;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::common::{Address, Metadata, Result, Stream};

/// User agent sent on every handshake
pub const USER_AGENT: &str = "DEV";

/// Handshake header naming the flow's destination
pub const HEADER_FORWARD_DEST: &str = "Forward-Dest";

/// Handshake header naming the flow's network
pub const HEADER_FORWARD_PROTO: &str = "Forward-Proto";

/// Transport trait for establishing raw connections
///
/// Implementations should ONLY handle connection establishment,
/// not encryption or framing.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;
}

/// Remote endpoint capable of opening a stream for a flow
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream for `metadata`
    ///
    /// The flag is `true` when the destination was carried by the handshake.
    /// When it is `false` the caller must send it in-band with
    /// [`send_destination`] before any payload.
    async fn dial(&self, metadata: &Metadata) -> Result<(Stream, bool)>;

    /// Stop accepting dials and release pooled resources
    async fn close(&self);
}

/// Forwarding headers for a fresh, destination-carrying handshake
pub fn forwarding_headers(metadata: &Metadata) -> Vec<(String, String)> {
    vec![
        (HEADER_FORWARD_DEST.to_string(), metadata.destination_address()),
        (HEADER_FORWARD_PROTO.to_string(), metadata.network.to_string()),
    ]
}

/// In-band destination block written at the start of a pooled stream
///
/// Same fields as the handshake headers, terminated by an empty line.
pub fn destination_preamble(metadata: &Metadata) -> Vec<u8> {
    let mut preamble = String::new();
    for (name, value) in forwarding_headers(metadata) {
        preamble.push_str(&name);
        preamble.push_str(": ");
        preamble.push_str(&value);
        preamble.push_str("\r\n");
    }
    preamble.push_str("\r\n");
    preamble.into_bytes()
}

/// Write the in-band destination block to a stream that was dialed blank
pub async fn send_destination(stream: &mut Stream, metadata: &Metadata) -> Result<()> {
    stream.write_all(&destination_preamble(metadata)).await?;
    stream.flush().await?;
    Ok(())
}
