//! Tunnel - flow dispatcher
//!
//! Two intake queues (TCP, UDP) feed a single dispatch loop which spawns one
//! handler task per flow event. Submission is a synchronous handoff: the
//! submitter waits until the loop has taken the event.
//!
//! ```text
//! NativeStack ─ submit_tcp / submit_udp ─▶ dispatch loop ─▶ handler task ─▶ Dialer
//! ```
//!
//! The dialer sits behind a read/write lock and can be swapped while flows
//! are in flight. Handlers snapshot it right before dialing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::Result;
use crate::error::Error;
use crate::stack::{TcpFlow, TransportHandler, UdpFlow};
use crate::transport::Dialer;

use super::handler;
use super::metrics::{FLOWS_DISPATCHED, FLOWS_FAILED};

/// One event in transit plus the acknowledgement the submitter waits on
struct Handoff<T> {
    flow: T,
    accepted: oneshot::Sender<()>,
}

type DialerSlot = Arc<RwLock<Arc<dyn Dialer>>>;

/// Lifecycle of the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Unstarted,
    Running,
    Stopped,
}

enum State {
    Unstarted {
        tcp_rx: mpsc::Receiver<Handoff<TcpFlow>>,
        udp_rx: mpsc::Receiver<Handoff<UdpFlow>>,
    },
    Running,
    Stopped,
}

/// Flow dispatcher with a live-swappable dialer
pub struct Tunnel {
    tcp_tx: mpsc::Sender<Handoff<TcpFlow>>,
    udp_tx: mpsc::Sender<Handoff<UdpFlow>>,
    state: Mutex<State>,
    cancel: CancellationToken,
    dialer: DialerSlot,
    loops_started: AtomicUsize,
}

impl Tunnel {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        let (tcp_tx, tcp_rx) = mpsc::channel(1);
        let (udp_tx, udp_rx) = mpsc::channel(1);

        Self {
            tcp_tx,
            udp_tx,
            state: Mutex::new(State::Unstarted { tcp_rx, udp_rx }),
            cancel: CancellationToken::new(),
            dialer: Arc::new(RwLock::new(dialer)),
            loops_started: AtomicUsize::new(0),
        }
    }

    /// Start the dispatch loop; later calls are no-ops
    pub fn start_dispatch(&self) {
        let mut state = self.state.lock();
        let (tcp_rx, udp_rx) = match std::mem::replace(&mut *state, State::Stopped) {
            State::Unstarted { tcp_rx, udp_rx } => (tcp_rx, udp_rx),
            State::Running => {
                *state = State::Running;
                return;
            }
            State::Stopped => return,
        };
        *state = State::Running;

        self.loops_started.fetch_add(1, Ordering::AcqRel);
        tokio::spawn(dispatch_loop(
            tcp_rx,
            udp_rx,
            self.dialer.clone(),
            self.cancel.clone(),
        ));
        info!("[TUNNEL] dispatch loop started");
    }

    /// Stop the dispatch loop; in-flight handlers keep running
    pub fn stop_dispatch(&self) {
        self.cancel.cancel();
        *self.state.lock() = State::Stopped;
        debug!("[TUNNEL] dispatch loop stopped");
    }

    pub fn state(&self) -> DispatchState {
        match *self.state.lock() {
            State::Unstarted { .. } => DispatchState::Unstarted,
            State::Running => DispatchState::Running,
            State::Stopped => DispatchState::Stopped,
        }
    }

    /// How many dispatch loops were ever spawned
    pub fn loops_started(&self) -> usize {
        self.loops_started.load(Ordering::Acquire)
    }

    /// Hand a TCP event to the loop and wait until it is accepted
    pub async fn submit_tcp(&self, flow: TcpFlow) -> Result<()> {
        self.submit(&self.tcp_tx, flow).await
    }

    /// Hand a UDP event to the loop and wait until it is accepted
    pub async fn submit_udp(&self, flow: UdpFlow) -> Result<()> {
        self.submit(&self.udp_tx, flow).await
    }

    async fn submit<T>(&self, queue: &mpsc::Sender<Handoff<T>>, flow: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::DispatcherClosed);
        }

        let (accepted, ack) = oneshot::channel();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::DispatcherClosed),
            sent = queue.send(Handoff { flow, accepted }) => {
                sent.map_err(|_| Error::DispatcherClosed)?;
            }
        }

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::DispatcherClosed),
            ack = ack => ack.map_err(|_| Error::DispatcherClosed),
        }
    }

    /// Replace the dialer, returning the previous one
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) -> Arc<dyn Dialer> {
        std::mem::replace(&mut *self.dialer.write(), dialer)
    }

    /// Current dialer
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        self.dialer.read().clone()
    }
}

#[async_trait]
impl TransportHandler for Tunnel {
    async fn handle_tcp(&self, flow: TcpFlow) -> Result<()> {
        self.submit_tcp(flow).await
    }

    async fn handle_udp(&self, flow: UdpFlow) -> Result<()> {
        self.submit_udp(flow).await
    }
}

async fn dispatch_loop(
    mut tcp_rx: mpsc::Receiver<Handoff<TcpFlow>>,
    mut udp_rx: mpsc::Receiver<Handoff<UdpFlow>>,
    dialer: DialerSlot,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            Some(handoff) = tcp_rx.recv() => {
                FLOWS_DISPATCHED.with_label_values(&["tcp"]).inc();
                let dialer = dialer.clone();
                let flow = handoff.flow;
                tokio::spawn(async move {
                    let id = flow.id;
                    let snapshot = dialer.read().clone();
                    if let Err(e) = handler::handle_tcp(flow, snapshot).await {
                        FLOWS_FAILED.with_label_values(&["tcp"]).inc();
                        debug!("[TUNNEL] tcp {} failed: {}", id, e);
                    }
                });
                let _ = handoff.accepted.send(());
            }
            Some(handoff) = udp_rx.recv() => {
                FLOWS_DISPATCHED.with_label_values(&["udp"]).inc();
                let dialer = dialer.clone();
                let flow = handoff.flow;
                tokio::spawn(async move {
                    let id = flow.id;
                    let snapshot = dialer.read().clone();
                    if let Err(e) = handler::handle_udp(flow, snapshot).await {
                        FLOWS_FAILED.with_label_values(&["udp"]).inc();
                        debug!("[TUNNEL] udp {} failed: {}", id, e);
                    }
                });
                let _ = handoff.accepted.send(());
            }
            else => break,
        }
    }
}
