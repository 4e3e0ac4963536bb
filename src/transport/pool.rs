//! Connection pool of pre-established edge connections
//!
//! Pooled connections are dialed blank (no destination headers) so any flow
//! can take one. A dial that finds the pool empty connects on demand with the
//! flow's destination in the handshake. Every dial triggers a background
//! refill.
//!
//! The outstanding counter covers pooled connections plus the one refill in
//! flight and never exceeds the configured capacity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::app::metrics::{POOL_EXPIRED, POOL_HITS, POOL_MISSES, POOL_REFILL_FAILURES};
use crate::common::{Metadata, Result, Stream};
use crate::error::Error;

use super::Dialer;

/// Something that can open one edge connection
///
/// `None` metadata means a blank connection destined for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, metadata: Option<&Metadata>) -> Result<Stream>;
}

/// A pooled connection with its creation time
struct PooledConnection {
    stream: Stream,
    created_at: Instant,
}

impl PooledConnection {
    fn new(stream: Stream) -> Self {
        Self {
            stream,
            created_at: Instant::now(),
        }
    }

    fn is_expired(&self, max_idle: Option<Duration>) -> bool {
        max_idle.is_some_and(|max| self.created_at.elapsed() > max)
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub outstanding: usize,
    pub capacity: usize,
}

struct PoolInner<C> {
    connector: C,
    capacity: usize,
    max_idle: Option<Duration>,
    idle: Mutex<VecDeque<PooledConnection>>,
    outstanding: AtomicUsize,
    refill_lock: tokio::sync::Mutex<()>,
    stopped: CancellationToken,
}

/// Dialer backed by a bounded pool of pre-dialed connections
pub struct PooledDialer<C> {
    inner: Arc<PoolInner<C>>,
}

impl<C: Connector> PooledDialer<C> {
    pub fn new(connector: C, capacity: usize) -> Self {
        Self::with_max_idle(connector, capacity, None)
    }

    /// Discard pooled connections older than `max_idle` instead of handing them out
    pub fn with_max_idle(connector: C, capacity: usize, max_idle: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connector,
                capacity,
                max_idle: max_idle.filter(|d| !d.is_zero()),
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                outstanding: AtomicUsize::new(0),
                refill_lock: tokio::sync::Mutex::new(()),
                stopped: CancellationToken::new(),
            }),
        }
    }

    /// Fill the pool in the background until it reaches capacity or a dial fails
    pub fn warm(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while !inner.stopped.is_cancelled()
                && inner.outstanding.load(Ordering::Acquire) < inner.capacity
            {
                if !inner.refill().await {
                    break;
                }
            }
            debug!("[POOL] warm-up done: {} idle", inner.idle.lock().len());
        });
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            outstanding: self.inner.outstanding.load(Ordering::Acquire),
            capacity: self.inner.capacity,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stopped.is_cancelled()
    }

    fn spawn_refill(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            inner.refill().await;
        });
    }
}

impl<C: Connector> PoolInner<C> {
    /// Pop the oldest usable connection, discarding stale ones
    fn take(&self) -> (Option<Stream>, Vec<Stream>) {
        let mut idle = self.idle.lock();
        let mut stale = Vec::new();

        while let Some(conn) = idle.pop_front() {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
            if conn.is_expired(self.max_idle) {
                POOL_EXPIRED.inc();
                stale.push(conn.stream);
                continue;
            }
            trace!("[POOL] reusing connection (age: {:?})", conn.created_at.elapsed());
            return (Some(conn.stream), stale);
        }

        (None, stale)
    }

    /// One pre-dial attempt; returns whether a connection was added
    async fn refill(&self) -> bool {
        let _guard = self.refill_lock.lock().await;

        if self.stopped.is_cancelled() || self.outstanding.load(Ordering::Acquire) >= self.capacity {
            return false;
        }

        // Reserve the slot for the dial in flight
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        match self.connector.connect(None).await {
            Ok(stream) => {
                let rejected = {
                    let mut idle = self.idle.lock();
                    if self.stopped.is_cancelled() || idle.len() >= self.capacity {
                        Some(stream)
                    } else {
                        idle.push_back(PooledConnection::new(stream));
                        None
                    }
                };
                match rejected {
                    Some(stream) => {
                        self.outstanding.fetch_sub(1, Ordering::AcqRel);
                        discard(stream).await;
                        false
                    }
                    None => true,
                }
            }
            Err(e) => {
                self.outstanding.fetch_sub(1, Ordering::AcqRel);
                POOL_REFILL_FAILURES.inc();
                debug!("[POOL] pre-dial failed: {}", e);
                false
            }
        }
    }
}

async fn discard(mut stream: Stream) {
    let _ = stream.shutdown().await;
}

#[async_trait]
impl<C: Connector> Dialer for PooledDialer<C> {
    async fn dial(&self, metadata: &Metadata) -> Result<(Stream, bool)> {
        if self.inner.stopped.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let (pooled, stale) = self.inner.take();
        for stream in stale {
            discard(stream).await;
        }

        let result = match pooled {
            Some(stream) => {
                POOL_HITS.inc();
                Ok((stream, false))
            }
            None => {
                POOL_MISSES.inc();
                self.inner
                    .connector
                    .connect(Some(metadata))
                    .await
                    .map(|stream| (stream, true))
            }
        };

        self.spawn_refill();
        result
    }

    async fn close(&self) {
        self.inner.stopped.cancel();

        let drained: Vec<PooledConnection> = {
            let mut idle = self.inner.idle.lock();
            idle.drain(..).collect()
        };
        self.inner
            .outstanding
            .fetch_sub(drained.len(), Ordering::AcqRel);

        debug!("[POOL] closing {} pooled connections", drained.len());
        for conn in drained {
            discard(conn.stream).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Network};
    use std::sync::atomic::AtomicBool;
    use tokio::io::{AsyncReadExt, DuplexStream};

    #[derive(Default)]
    struct MockConnector {
        calls: Mutex<Vec<Option<Metadata>>>,
        peers: Mutex<Vec<DuplexStream>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Connector for Arc<MockConnector> {
        async fn connect(&self, metadata: Option<&Metadata>) -> Result<Stream> {
            self.calls.lock().push(metadata.cloned());
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::Transport("edge unreachable".into()));
            }
            let (client, server) = tokio::io::duplex(1024);
            self.peers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    /// Connector whose dials block until a permit is released
    struct GatedConnector {
        gate: tokio::sync::Semaphore,
        entered: tokio::sync::Notify,
        peers: Mutex<Vec<DuplexStream>>,
    }

    impl GatedConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: tokio::sync::Semaphore::new(0),
                entered: tokio::sync::Notify::new(),
                peers: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Connector for Arc<GatedConnector> {
        async fn connect(&self, _metadata: Option<&Metadata>) -> Result<Stream> {
            self.entered.notify_one();
            self.gate
                .acquire()
                .await
                .map_err(|_| Error::TransportClosed)?
                .forget();
            let (client, server) = tokio::io::duplex(1024);
            self.peers.lock().push(server);
            Ok(Box::new(client))
        }
    }

    fn metadata() -> Metadata {
        Metadata::new(
            Address::from_host("10.0.0.2", 40000),
            Address::from_host("93.184.216.34", 443),
            Network::Tcp,
        )
    }

    async fn wait_for_idle<C: Connector>(dialer: &PooledDialer<C>, idle: usize) {
        for _ in 0..100 {
            if dialer.stats().idle == idle {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool never reached {} idle connections: {:?}", idle, dialer.stats());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_always_dials_with_headers() {
        let connector = Arc::new(MockConnector::default());
        let dialer = PooledDialer::new(connector.clone(), 0);

        for _ in 0..3 {
            let (_stream, metadata_sent) = dialer.dial(&metadata()).await.unwrap();
            assert!(metadata_sent);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(dialer.stats().idle, 0);
        assert_eq!(dialer.stats().outstanding, 0);
        let calls = connector.calls.lock();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|m| m.as_ref() == Some(&metadata())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pooled_connection_is_blank() {
        let connector = Arc::new(MockConnector::default());
        let dialer = PooledDialer::new(connector.clone(), 1);

        dialer.warm();
        wait_for_idle(&dialer, 1).await;
        assert_eq!(connector.calls.lock()[0], None);

        let (_stream, metadata_sent) = dialer.dial(&metadata()).await.unwrap();
        assert!(!metadata_sent);

        // the dial kicks off a refill
        wait_for_idle(&dialer, 1).await;
        assert_eq!(connector.calls.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outstanding_never_exceeds_capacity() {
        let connector = Arc::new(MockConnector::default());
        let dialer = Arc::new(PooledDialer::new(connector.clone(), 2));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let dialer = dialer.clone();
            handles.push(tokio::spawn(async move {
                let stats = dialer.stats();
                assert!(stats.outstanding <= stats.capacity);
                dialer.dial(&metadata()).await.map(|(_, sent)| sent)
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
            let stats = dialer.stats();
            assert!(stats.outstanding <= stats.capacity);
        }

        wait_for_idle(&dialer, 2).await;
        assert_eq!(dialer.stats().outstanding, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_rejects_dials_and_closes_pooled() {
        let connector = Arc::new(MockConnector::default());
        let dialer = PooledDialer::new(connector.clone(), 2);

        dialer.warm();
        wait_for_idle(&dialer, 2).await;

        dialer.close().await;
        assert!(dialer.is_closed());
        assert_eq!(dialer.stats().outstanding, 0);
        assert!(matches!(
            dialer.dial(&metadata()).await,
            Err(Error::TransportClosed)
        ));

        // the far side of every pooled connection sees EOF
        let mut peers = std::mem::take(&mut *connector.peers.lock());
        for peer in peers.iter_mut() {
            let mut buf = [0u8; 1];
            assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_predial_finishing_after_close_is_not_pooled() {
        let connector = GatedConnector::new();
        let dialer = PooledDialer::new(connector.clone(), 1);

        dialer.warm();
        connector.entered.notified().await;
        assert_eq!(dialer.stats().outstanding, 1);

        dialer.close().await;
        connector.gate.add_permits(1);

        for _ in 0..100 {
            if !connector.peers.lock().is_empty() && dialer.stats().outstanding == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let mut peer = connector.peers.lock().remove(0);
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
        assert_eq!(dialer.stats().idle, 0);
        assert_eq!(dialer.stats().outstanding, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connections_are_discarded() {
        let connector = Arc::new(MockConnector::default());
        let dialer =
            PooledDialer::with_max_idle(connector.clone(), 1, Some(Duration::from_secs(30)));

        dialer.warm();
        wait_for_idle(&dialer, 1).await;

        tokio::time::advance(Duration::from_secs(31)).await;

        let (_stream, metadata_sent) = dialer.dial(&metadata()).await.unwrap();
        assert!(metadata_sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreground_failure_is_returned() {
        let connector = Arc::new(MockConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let dialer = PooledDialer::new(connector.clone(), 1);

        assert!(matches!(
            dialer.dial(&metadata()).await,
            Err(Error::Transport(_))
        ));

        // the background refill fails quietly and releases its slot
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(dialer.stats().outstanding, 0);
    }
}
