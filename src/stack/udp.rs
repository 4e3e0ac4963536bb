//! UDP session table
//!
//! One cached edge stream per 4-tuple. The first datagram of a tuple reserves
//! the slot and dials; datagrams arriving while the dial is in flight are
//! queued and flushed once the stream is attached. Replies read from the
//! stream are wrapped back into IP packets and written to the device.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::app::metrics::{format_bytes, UDP_SESSIONS_ACTIVE, UDP_SESSIONS_EVICTED};
use crate::common::{EndpointId, Stream};
use crate::device::Device;

use super::packet::build_udp_packet;

/// Default idle timeout of a UDP session
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Datagrams queued per session before new ones are dropped
const SESSION_QUEUE: usize = 64;

/// Largest datagram read back from the edge
const REPLY_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of offering a datagram to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// Handed to an existing or pending session
    Forwarded,
    /// No session existed; the caller must dial and [`UdpSessions::attach`]
    Reserved,
}

struct ActiveSession {
    uplink: mpsc::Sender<Bytes>,
    downlink: AbortHandle,
    last_seen: Instant,
    generation: u64,
}

enum Slot {
    Pending(Vec<Bytes>),
    Active(ActiveSession),
}

struct Table {
    slots: HashMap<EndpointId, Slot>,
    next_generation: u64,
}

/// Session table shared by the stack and the UDP handlers
pub struct UdpSessions {
    table: Mutex<Table>,
    timeout: Duration,
    device: Arc<dyn Device>,
    this: Weak<UdpSessions>,
}

impl UdpSessions {
    pub fn new(device: Arc<dyn Device>, timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            table: Mutex::new(Table {
                slots: HashMap::new(),
                next_generation: 0,
            }),
            timeout,
            device,
            this: this.clone(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Offer a datagram; reserves the tuple when no session exists
    pub fn offer(&self, id: EndpointId, payload: Bytes) -> Reservation {
        let mut table = self.table.lock();
        match table.slots.get_mut(&id) {
            Some(Slot::Active(session)) => {
                session.last_seen = Instant::now();
                if session.uplink.try_send(payload).is_err() {
                    trace!("[UDP] {} queue full, datagram dropped", id);
                }
                Reservation::Forwarded
            }
            Some(Slot::Pending(queued)) => {
                if queued.len() < SESSION_QUEUE {
                    queued.push(payload);
                }
                Reservation::Forwarded
            }
            None => {
                table.slots.insert(id, Slot::Pending(vec![payload]));
                Reservation::Reserved
            }
        }
    }

    /// Give up a reservation whose dial failed
    pub fn abandon(&self, id: &EndpointId) {
        let mut table = self.table.lock();
        if matches!(table.slots.get(id), Some(Slot::Pending(_))) {
            table.slots.remove(id);
        }
    }

    /// Attach the dialed stream to a reserved tuple and start relaying
    pub fn attach(&self, id: EndpointId, stream: Stream) {
        let (reader, writer) = tokio::io::split(stream);
        let (uplink, rx) = mpsc::channel(SESSION_QUEUE);

        let mut table = self.table.lock();
        let queued = match table.slots.remove(&id) {
            Some(Slot::Pending(queued)) => queued,
            other => {
                // Reservation was swept or abandoned meanwhile
                if let Some(slot) = other {
                    table.slots.insert(id, slot);
                }
                debug!("[UDP] {} no longer reserved, dropping stream", id);
                return;
            }
        };
        for payload in queued {
            let _ = uplink.try_send(payload);
        }

        let generation = table.next_generation;
        table.next_generation += 1;

        tokio::spawn(run_uplink(id, rx, writer));
        let downlink = tokio::spawn(run_downlink(
            id,
            reader,
            self.device.clone(),
            self.this.clone(),
            generation,
        ))
        .abort_handle();

        table.slots.insert(
            id,
            Slot::Active(ActiveSession {
                uplink,
                downlink,
                last_seen: Instant::now(),
                generation,
            }),
        );
        UDP_SESSIONS_ACTIVE.inc();
        debug!("[UDP] session opened {}", id);
    }

    /// Evict sessions idle longer than the timeout; returns how many went
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let evicted: Vec<(EndpointId, ActiveSession)> = {
            let mut table = self.table.lock();
            let expired: Vec<EndpointId> = table
                .slots
                .iter()
                .filter_map(|(id, slot)| match slot {
                    Slot::Active(session) if now.duration_since(session.last_seen) > self.timeout => {
                        Some(*id)
                    }
                    _ => None,
                })
                .collect();
            expired
                .into_iter()
                .filter_map(|id| match table.slots.remove(&id) {
                    Some(Slot::Active(session)) => Some((id, session)),
                    _ => None,
                })
                .collect()
        };

        for (id, session) in &evicted {
            session.downlink.abort();
            trace!("[UDP] session evicted {}", id);
        }
        if !evicted.is_empty() {
            UDP_SESSIONS_ACTIVE.sub(evicted.len() as i64);
            UDP_SESSIONS_EVICTED.inc_by(evicted.len() as u64);
            debug!("[UDP] swept {} idle sessions", evicted.len());
        }
        evicted.len()
    }

    /// Drop every session
    pub fn close_all(&self) {
        let slots: Vec<Slot> = {
            let mut table = self.table.lock();
            table.slots.drain().map(|(_, slot)| slot).collect()
        };
        for slot in slots {
            if let Slot::Active(session) = slot {
                session.downlink.abort();
                UDP_SESSIONS_ACTIVE.dec();
            }
        }
    }

    /// Number of active sessions
    pub fn len(&self) -> usize {
        self.table
            .lock()
            .slots
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record reply activity for the session that owns `generation`
    fn touch(&self, id: &EndpointId, generation: u64) {
        let mut table = self.table.lock();
        if let Some(Slot::Active(session)) = table.slots.get_mut(id) {
            if session.generation == generation {
                session.last_seen = Instant::now();
            }
        }
    }

    fn remove_finished(&self, id: &EndpointId, generation: u64) {
        let mut table = self.table.lock();
        if let Some(Slot::Active(session)) = table.slots.get(id) {
            if session.generation == generation {
                table.slots.remove(id);
                UDP_SESSIONS_ACTIVE.dec();
            }
        }
    }
}

/// Datagrams from the device to the edge; ends when the session is dropped
async fn run_uplink(id: EndpointId, mut rx: mpsc::Receiver<Bytes>, mut writer: WriteHalf<Stream>) {
    let mut total: u64 = 0;
    while let Some(payload) = rx.recv().await {
        // write_all skips empty buffers; an empty datagram is still one message
        let written = if payload.is_empty() {
            writer.write(&payload).await.map(|_| ())
        } else {
            writer.write_all(&payload).await
        };
        if written.is_err() || writer.flush().await.is_err() {
            break;
        }
        total += payload.len() as u64;
    }
    let _ = writer.shutdown().await;
    trace!("[UDP] {} uplink closed (↑{})", id, format_bytes(total));
}

/// Replies from the edge back to the device
async fn run_downlink(
    id: EndpointId,
    mut reader: ReadHalf<Stream>,
    device: Arc<dyn Device>,
    sessions: Weak<UdpSessions>,
    generation: u64,
) {
    let mut buf = vec![0u8; REPLY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };

        // The reply travels from the flow's destination back to its source
        let Some(packet) = build_udp_packet(id.local(), id.remote(), &buf[..n]) else {
            trace!("[UDP] {} reply of {} bytes not representable", id, n);
            continue;
        };
        if let Err(e) = device.write(&packet).await {
            debug!("[UDP] {} reply write failed: {}", id, e);
            break;
        }
        total += n as u64;

        let Some(table) = sessions.upgrade() else {
            break;
        };
        table.touch(&id, generation);
    }

    trace!("[UDP] {} downlink closed (↓{})", id, format_bytes(total));
    if let Some(sessions) = sessions.upgrade() {
        sessions.remove_finished(&id, generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MemoryDevice;
    use crate::stack::packet::{parse, Packet};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

    /// Stream that records every write call and never yields data
    struct RecordingStream {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncRead for RecordingStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for RecordingStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            self.writes.lock().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn endpoint() -> EndpointId {
        EndpointId::from_packet(
            "10.0.0.2".parse().unwrap(),
            5353,
            "1.1.1.1".parse().unwrap(),
            53,
        )
    }

    fn edge_stream() -> (Stream, DuplexStream) {
        let (client, server) = tokio::io::duplex(4096);
        (Box::new(client), server)
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_first_datagram_reserves_then_queues() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device, DEFAULT_UDP_TIMEOUT);
        let id = endpoint();

        assert_eq!(sessions.offer(id, Bytes::from_static(b"a")), Reservation::Reserved);
        assert_eq!(sessions.offer(id, Bytes::from_static(b"b")), Reservation::Forwarded);
        assert!(sessions.is_empty());

        let (stream, mut edge) = edge_stream();
        sessions.attach(id, stream);
        assert_eq!(sessions.len(), 1);

        let mut buf = [0u8; 2];
        edge.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ab");

        assert_eq!(sessions.offer(id, Bytes::from_static(b"c")), Reservation::Forwarded);
        let mut buf = [0u8; 1];
        edge.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"c");
    }

    #[tokio::test]
    async fn test_abandon_allows_new_reservation() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device, DEFAULT_UDP_TIMEOUT);
        let id = endpoint();

        assert_eq!(sessions.offer(id, Bytes::from_static(b"a")), Reservation::Reserved);
        sessions.abandon(&id);
        assert_eq!(sessions.offer(id, Bytes::from_static(b"a")), Reservation::Reserved);
    }

    #[tokio::test]
    async fn test_replies_written_to_device() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device.clone(), DEFAULT_UDP_TIMEOUT);
        let id = endpoint();

        sessions.offer(id, Bytes::from_static(b"query"));
        let (stream, mut edge) = edge_stream();
        sessions.attach(id, stream);

        edge.write_all(b"answer").await.unwrap();
        wait_until(|| !device.written().is_empty()).await;

        let written = device.written();
        let Some(Packet::Udp(reply)) = parse(&written[0]).unwrap() else {
            panic!("expected a UDP reply");
        };
        assert_eq!(reply.id.remote(), "1.1.1.1:53".parse().unwrap());
        assert_eq!(reply.id.local(), "10.0.0.2:5353".parse().unwrap());
        assert_eq!(&reply.payload[..], b"answer");
    }

    #[tokio::test]
    async fn test_edge_close_removes_session() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device, DEFAULT_UDP_TIMEOUT);
        let id = endpoint();

        sessions.offer(id, Bytes::from_static(b"x"));
        let (stream, edge) = edge_stream();
        sessions.attach(id, stream);
        assert_eq!(sessions.len(), 1);

        drop(edge);
        let table = sessions.clone();
        wait_until(move || table.is_empty()).await;
    }

    #[tokio::test]
    async fn test_empty_datagram_is_written() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device, DEFAULT_UDP_TIMEOUT);
        let id = endpoint();
        let writes = Arc::new(Mutex::new(Vec::new()));

        assert_eq!(sessions.offer(id, Bytes::new()), Reservation::Reserved);
        sessions.attach(
            id,
            Box::new(RecordingStream {
                writes: writes.clone(),
            }),
        );
        sessions.offer(id, Bytes::from_static(b"next"));

        let seen = writes.clone();
        wait_until(move || seen.lock().len() == 2).await;
        assert_eq!(*writes.lock(), vec![Vec::new(), b"next".to_vec()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replies_keep_session_alive() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device.clone(), Duration::from_secs(60));
        let id = endpoint();

        sessions.offer(id, Bytes::from_static(b"subscribe"));
        let (stream, mut edge) = edge_stream();
        sessions.attach(id, stream);

        // the client stays quiet while the edge keeps answering
        for replies in 1..=15 {
            tokio::time::advance(Duration::from_secs(5)).await;
            edge.write_all(b"update").await.unwrap();
            wait_until(|| device.written().len() == replies).await;
        }

        assert_eq!(sessions.sweep(), 0);
        assert_eq!(sessions.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_idle_and_closes_stream() {
        let (device, _tx) = MemoryDevice::new(1500);
        let sessions = UdpSessions::new(device, Duration::from_secs(60));
        let idle = endpoint();
        let busy = EndpointId::from_packet(
            "10.0.0.2".parse().unwrap(),
            5354,
            "8.8.8.8".parse().unwrap(),
            53,
        );

        let (stream, mut idle_edge) = edge_stream();
        sessions.offer(idle, Bytes::from_static(b"1"));
        sessions.attach(idle, stream);
        let (stream, _busy_edge) = edge_stream();
        sessions.offer(busy, Bytes::from_static(b"1"));
        sessions.attach(busy, stream);

        tokio::time::advance(Duration::from_secs(45)).await;
        sessions.offer(busy, Bytes::from_static(b"2"));
        assert_eq!(sessions.sweep(), 0);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(sessions.sweep(), 1);
        assert_eq!(sessions.len(), 1);

        // the evicted session's edge stream reaches EOF
        let mut received = Vec::new();
        idle_edge.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"1");

        sessions.close_all();
        assert!(sessions.is_empty());
    }
}
