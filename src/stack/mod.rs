//! Native Stack - packet demultiplexer
//!
//! Reads raw IP packets from a [`Device`], classifies them and hands one flow
//! event per packet to a [`TransportHandler`]. The handoff is synchronous:
//! the read loop does not pull the next packet until the current event has
//! been accepted.
//!
//! ```text
//! Device.read() → packet::parse() → TcpFlow / UdpFlow → TransportHandler
//! ```

pub mod packet;
mod udp;

pub use packet::{Packet, TcpFlags, TcpSegment, UdpDatagram};
pub use udp::{Reservation, UdpSessions, DEFAULT_UDP_TIMEOUT};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::app::metrics::{PACKETS_DROPPED, PACKETS_RECEIVED};
use crate::common::{EndpointId, Result};
use crate::device::Device;
use crate::error::Error;

/// Slack added to the MTU for the read buffer
pub const READ_SLACK: usize = 128;

/// Upper bound on the idle-sweep period
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// One captured TCP packet
pub type TcpFlow = TcpSegment;

/// One captured UDP datagram plus the table its session lives in
pub struct UdpFlow {
    pub id: EndpointId,
    pub payload: Bytes,
    pub sessions: Arc<UdpSessions>,
}

impl std::fmt::Debug for UdpFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpFlow")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Receiver of flow events
///
/// Both methods return once the event has been accepted, not handled.
#[async_trait]
pub trait TransportHandler: Send + Sync {
    async fn handle_tcp(&self, flow: TcpFlow) -> Result<()>;

    async fn handle_udp(&self, flow: UdpFlow) -> Result<()>;
}

struct StackInner {
    device: Arc<dyn Device>,
    handler: Arc<dyn TransportHandler>,
    sessions: Arc<UdpSessions>,
    mtu: usize,
}

/// Packet demultiplexer bound to one device
pub struct NativeStack {
    inner: Arc<StackInner>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NativeStack {
    pub fn new(device: Arc<dyn Device>, handler: Arc<dyn TransportHandler>, mtu: usize) -> Self {
        Self::with_udp_timeout(device, handler, mtu, DEFAULT_UDP_TIMEOUT)
    }

    pub fn with_udp_timeout(
        device: Arc<dyn Device>,
        handler: Arc<dyn TransportHandler>,
        mtu: usize,
        udp_timeout: Duration,
    ) -> Self {
        let sessions = UdpSessions::new(device.clone(), udp_timeout);
        Self {
            inner: Arc::new(StackInner {
                device,
                handler,
                sessions,
                mtu,
            }),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the read loop and the idle sweep; returns immediately
    pub fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::DeviceClosed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let read_loop = tokio::spawn(read_loop(self.inner.clone(), self.cancel.clone()));
        let sweeper = tokio::spawn(sweep_loop(self.inner.sessions.clone(), self.cancel.clone()));
        self.tasks.lock().extend([read_loop, sweeper]);

        info!(
            "[NATIVE] {}://{} attached (mtu {})",
            self.inner.device.kind(),
            self.inner.device.name(),
            self.inner.mtu
        );
        Ok(())
    }

    /// Signal the loops and wait for them to exit
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.inner.sessions.close_all();
        debug!("[NATIVE] stopped");
    }

    /// Fires when the stack stops, including after a fatal device error
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Classify one packet and hand its flow event over
    pub async fn handle_packet(&self, packet: &[u8]) -> Result<()> {
        self.inner.handle_packet(packet).await
    }
}

impl StackInner {
    async fn handle_packet(&self, packet: &[u8]) -> Result<()> {
        let parsed = match packet::parse(packet) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(e) => {
                PACKETS_DROPPED.with_label_values(&[e.reason()]).inc();
                return Err(e.into());
            }
        };

        match parsed {
            Packet::Tcp(segment) => self.handler.handle_tcp(segment).await,
            Packet::Udp(datagram) => {
                self.handler
                    .handle_udp(UdpFlow {
                        id: datagram.id,
                        payload: datagram.payload,
                        sessions: self.sessions.clone(),
                    })
                    .await
            }
            Packet::Icmp => {
                trace!("[NATIVE] ICMP packet ignored");
                Ok(())
            }
        }
    }
}

async fn read_loop(inner: Arc<StackInner>, cancel: CancellationToken) {
    let mut buf = vec![0u8; inner.mtu + READ_SLACK];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.device.read(&mut buf) => match result {
                Ok(n) => n,
                Err(Error::DeviceClosed) => {
                    debug!("[NATIVE] device closed");
                    break;
                }
                Err(e) => {
                    error!("[NATIVE] failed to read from device: {}", e);
                    break;
                }
            },
        };
        PACKETS_RECEIVED.inc();

        tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.handle_packet(&buf[..n]) => match result {
                Ok(()) => {}
                Err(Error::Packet(e)) => debug!("[NATIVE] dropped packet: {}", e),
                Err(e) => debug!("[NATIVE] flow not accepted: {}", e),
            },
        }
    }

    cancel.cancel();
}

async fn sweep_loop(sessions: Arc<UdpSessions>, cancel: CancellationToken) {
    let period = sessions.timeout().min(MAX_SWEEP_INTERVAL);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                sessions.sweep();
            }
        }
    }
}
