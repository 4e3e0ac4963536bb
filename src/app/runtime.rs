//! Runtime - wiring and lifecycle
//!
//! [`Engine`] is the explicit context object: it owns the dispatcher, the
//! device and the demultiplexer bound to it. [`Runtime`] builds an engine from
//! a [`Config`] and drives it until Ctrl+C or a fatal device error. On Unix a
//! SIGHUP reloads the configuration and hot-swaps the dialer.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::Result;
use crate::config::Config;
use crate::device::{self, Device};
use crate::error::Error;
use crate::stack::NativeStack;
use crate::transport::{ArgoConnector, Dialer, PooledDialer};

use super::dispatcher::Tunnel;
use super::metrics::init_metrics;
use super::stats_api::start_api_server;

struct Attached {
    device: Arc<dyn Device>,
    stack: NativeStack,
}

/// Dispatcher plus the device and stack attached to it
pub struct Engine {
    tunnel: Arc<Tunnel>,
    attached: Mutex<Option<Attached>>,
}

impl Engine {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            tunnel: Arc::new(Tunnel::new(dialer)),
            attached: Mutex::new(None),
        }
    }

    /// Start dispatching, then open the device and attach a stack to it.
    ///
    /// Returns the stack's cancellation token, which fires when the stack
    /// dies on its own (device error) or is stopped.
    pub fn start<F>(&self, open_device: F, udp_timeout: Duration) -> Result<CancellationToken>
    where
        F: FnOnce() -> Result<Arc<dyn Device>>,
    {
        if self.attached.lock().is_some() {
            return Err(Error::Config("engine already started".into()));
        }

        self.tunnel.start_dispatch();

        let device = match open_device() {
            Ok(device) => device,
            Err(e) => {
                self.tunnel.stop_dispatch();
                return Err(e);
            }
        };

        let stack = NativeStack::with_udp_timeout(
            device.clone(),
            self.tunnel.clone(),
            device.mtu(),
            udp_timeout,
        );
        if let Err(e) = stack.start() {
            self.tunnel.stop_dispatch();
            let _ = device.close();
            return Err(e);
        }

        let stopped = stack.cancellation();
        *self.attached.lock() = Some(Attached { device, stack });
        Ok(stopped)
    }

    /// Swap the dialer; the previous one is closed in the background
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        let previous = self.tunnel.set_dialer(dialer);
        tokio::spawn(async move {
            previous.close().await;
        });
        info!("[ENGINE] dialer replaced");
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn is_running(&self) -> bool {
        self.attached.lock().is_some()
    }

    /// Stop the stack, close the device and the dialer
    pub async fn stop(&self) {
        let attached = self.attached.lock().take();
        if let Some(attached) = attached {
            if let Err(e) = attached.device.close() {
                debug!("[ENGINE] device close: {}", e);
            }
            attached.stack.stop().await;
        }
        self.tunnel.stop_dispatch();
        self.tunnel.dialer().close().await;
        info!("[ENGINE] stopped");
    }
}

/// Build a warmed pool of edge connections from `config`
pub fn build_dialer(config: &Config) -> Result<Arc<dyn Dialer>> {
    let connector = ArgoConnector::new(&config.argo_options())?;
    info!(
        "[ENGINE] edge {} via {} (pool {})",
        connector.host(),
        connector.address(),
        config.argo.pool_size
    );
    let pool = PooledDialer::with_max_idle(connector, config.argo.pool_size, config.max_idle());
    pool.warm();
    Ok(Arc::new(pool))
}

/// Parse the metrics listen address
pub fn parse_listen_address(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|_| Error::Config(format!("Invalid listen address: {}", s)))
}

/// Runtime manages the client lifecycle
pub struct Runtime {
    config: Config,
    config_path: Option<PathBuf>,
    api_listen: Option<String>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    pub fn new(config: Config, config_path: Option<PathBuf>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let api_listen = config.api.as_ref().map(|api| api.listen.clone());
        Self {
            config,
            config_path,
            api_listen,
            shutdown_tx,
        }
    }

    /// Override the metrics listen address from the config
    pub fn with_api_listen(mut self, listen: Option<String>) -> Self {
        if listen.is_some() {
            self.api_listen = listen;
        }
        self
    }

    /// Run until Ctrl+C or the stack dies
    pub async fn run(&self) -> Result<()> {
        init_metrics();

        let api_handle = match &self.api_listen {
            Some(listen) => {
                let addr = parse_listen_address(listen)?;
                let shutdown_rx = self.shutdown_tx.subscribe();
                Some(tokio::spawn(start_api_server(addr, shutdown_rx)))
            }
            None => None,
        };

        let engine = Engine::new(build_dialer(&self.config)?);
        let url = self.config.device_url()?;
        let options = self.config.tun_options();
        let stopped = engine.start(|| device::open(&url, options), self.config.udp_timeout())?;
        info!("Runtime started on {}", url);

        let mut reload = ReloadSignal::new();
        let result = loop {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        error!("Failed to listen for Ctrl+C: {}", e);
                    }
                    info!("Shutting down...");
                    break Ok(());
                }
                _ = stopped.cancelled() => {
                    error!("Packet stack terminated, shutting down");
                    break Err(Error::DeviceClosed);
                }
                _ = reload.recv() => {
                    self.reload(&engine);
                }
            }
        };

        let _ = self.shutdown_tx.send(());
        engine.stop().await;
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }

        result
    }

    /// Re-read the config file and swap in a dialer built from it
    fn reload(&self, engine: &Engine) {
        let Some(path) = &self.config_path else {
            warn!("Reload requested but no config file is in use");
            return;
        };

        let config = match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Reload of {} failed: {}", path.display(), e);
                return;
            }
        };

        match build_dialer(&config) {
            Ok(dialer) => {
                engine.set_dialer(dialer);
                info!("Reloaded edge settings from {}", path.display());
            }
            Err(e) => warn!("Reload of {} failed: {}", path.display(), e),
        }
    }
}

/// SIGHUP listener
#[cfg(unix)]
struct ReloadSignal(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl ReloadSignal {
    fn new() -> Self {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::hangup()) {
            Ok(sig) => Self(Some(sig)),
            Err(e) => {
                warn!("SIGHUP reload unavailable: {}", e);
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        match &mut self.0 {
            Some(sig) => {
                if sig.recv().await.is_none() {
                    self.0 = None;
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending().await,
        }
    }
}

/// No reload signal on this platform
#[cfg(not(unix))]
struct ReloadSignal;

#[cfg(not(unix))]
impl ReloadSignal {
    fn new() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending().await
    }
}
