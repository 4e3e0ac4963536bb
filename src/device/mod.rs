//! Device Layer
//!
//! Responsibilities:
//! - Present a virtual network interface as a packet source/sink
//! - NO packet parsing, NO flow handling
//!
//! Every concrete device variant implements the [`Device`] capability trait;
//! the set of variants is closed and named by [`DeviceKind`].

mod tun_device;

pub use tun_device::{TunDevice, TunOptions};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::Result;
use crate::error::Error;

/// Capability interface of a packet device
///
/// `read` returns exactly one IP packet per call. After `close`, pending and
/// future reads fail with [`Error::DeviceClosed`].
#[async_trait]
pub trait Device: Send + Sync {
    /// Read one packet into `buf`
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one packet
    async fn write(&self, packet: &[u8]) -> Result<usize>;

    /// Close the device, unblocking any pending read
    fn close(&self) -> Result<()>;

    /// Maximum transmission unit
    fn mtu(&self) -> usize;

    /// Interface name
    fn name(&self) -> &str;

    /// Driver kind
    fn kind(&self) -> DeviceKind;
}

/// Supported device drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Tun,
}

impl DeviceKind {
    fn from_scheme(scheme: &str) -> Result<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "tun" => Ok(DeviceKind::Tun),
            other => Err(Error::Unsupported(format!("device driver: {}", other))),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Tun => write!(f, "tun"),
        }
    }
}

/// Parsed device URL such as `tun://cftun0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUrl {
    pub kind: DeviceKind,
    pub name: String,
}

impl DeviceUrl {
    /// Parse a device URL; a bare name defaults to the tun driver
    pub fn parse(s: &str) -> Result<Self> {
        let (scheme, rest) = s.split_once("://").unwrap_or(("tun", s));
        let kind = DeviceKind::from_scheme(scheme)?;
        let name = rest.trim_end_matches('/');
        if name.is_empty() {
            return Err(Error::Config(format!("Device name missing in {:?}", s)));
        }
        Ok(Self {
            kind,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for DeviceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.kind, self.name)
    }
}

/// Open a device from its URL
pub fn open(url: &DeviceUrl, options: TunOptions) -> Result<Arc<dyn Device>> {
    match url.kind {
        DeviceKind::Tun => Ok(Arc::new(TunDevice::open(&url.name, options)?)),
    }
}
