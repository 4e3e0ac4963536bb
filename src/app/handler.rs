//! Per-flow handlers
//!
//! TCP events are surrogates: a SYN opens an edge stream for the flow's
//! destination and releases it again, FIN/RST are recorded as close intent.
//! UDP events are relayed through the session table.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, trace};

use crate::common::{Metadata, Network, Result, Stream};
use crate::stack::{Reservation, TcpFlow, UdpFlow};
use crate::transport::{send_destination, Dialer};

/// Dial for `metadata`, sending the destination in-band if the handshake did not
async fn open_stream(dialer: &Arc<dyn Dialer>, metadata: &Metadata) -> Result<Stream> {
    let (mut stream, metadata_sent) = dialer.dial(metadata).await?;
    if !metadata_sent {
        send_destination(&mut stream, metadata).await?;
    }
    Ok(stream)
}

pub(crate) async fn handle_tcp(flow: TcpFlow, dialer: Arc<dyn Dialer>) -> Result<()> {
    if flow.flags.rst || flow.flags.fin {
        debug!(
            "[TUNNEL] tcp {} close intent (fin={}, rst={})",
            flow.id, flow.flags.fin, flow.flags.rst
        );
        return Ok(());
    }

    if !flow.flags.syn {
        trace!("[TUNNEL] tcp {} seq={} ack={}", flow.id, flow.seq, flow.ack);
        return Ok(());
    }

    let metadata = flow.id.metadata(Network::Tcp);
    let mut stream = open_stream(&dialer, &metadata).await?;
    info!(
        "[TUNNEL] tcp {} -> {} via edge",
        metadata.source,
        metadata.destination_address()
    );

    // No reassembled byte stream to relay
    if let Err(e) = stream.shutdown().await {
        trace!("[TUNNEL] tcp {} close: {}", flow.id, e);
    }
    Ok(())
}

pub(crate) async fn handle_udp(flow: UdpFlow, dialer: Arc<dyn Dialer>) -> Result<()> {
    let UdpFlow {
        id,
        payload,
        sessions,
    } = flow;

    if sessions.offer(id, payload) == Reservation::Forwarded {
        return Ok(());
    }

    let metadata = id.metadata(Network::Udp);
    match open_stream(&dialer, &metadata).await {
        Ok(stream) => {
            info!(
                "[TUNNEL] udp {} -> {} via edge",
                metadata.source,
                metadata.destination_address()
            );
            sessions.attach(id, stream);
            Ok(())
        }
        Err(e) => {
            sessions.abandon(&id);
            Err(e)
        }
    }
}
