//! TUN device backed by the `tun` crate

use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tun::{AbstractDevice, Configuration, DeviceReader, DeviceWriter};

use crate::common::Result;
use crate::error::Error;

use super::{Device, DeviceKind};

/// Options applied when opening a TUN interface
#[derive(Debug, Clone, Default)]
pub struct TunOptions {
    pub mtu: u16,
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
}

/// A TUN interface split into independently locked read and write halves
pub struct TunDevice {
    reader: Mutex<DeviceReader>,
    writer: Mutex<DeviceWriter>,
    closed: CancellationToken,
    name: String,
    mtu: usize,
}

impl TunDevice {
    /// Create the interface and bring it up
    pub fn open(name: &str, options: TunOptions) -> Result<Self> {
        let mut config = Configuration::default();

        #[allow(deprecated)]
        config.name(name);
        if options.mtu > 0 {
            config.mtu(options.mtu);
        }
        if let Some(address) = options.address {
            config.address(address);
        }
        if let Some(netmask) = options.netmask {
            config.netmask(netmask);
        }
        config.up();

        let device = tun::create_as_async(&config)
            .map_err(|e| Error::Device(format!("Failed to create TUN device {}: {}", name, e)))?;

        let name = device
            .tun_name()
            .map_err(|e| Error::Device(format!("Failed to get TUN name: {}", e)))?;

        // The tun crate hands back (writer, reader)
        let (writer, reader) = device
            .split()
            .map_err(|e| Error::Device(format!("Failed to split TUN device: {}", e)))?;

        info!("[TUN] opened {} (mtu {})", name, options.mtu);

        Ok(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
            name,
            mtu: options.mtu as usize,
        })
    }
}

#[async_trait]
impl Device for TunDevice {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut reader = self.reader.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Err(Error::DeviceClosed),
            n = reader.read(buf) => Ok(n?),
        }
    }

    async fn write(&self, packet: &[u8]) -> Result<usize> {
        if self.closed.is_cancelled() {
            return Err(Error::DeviceClosed);
        }
        let mut writer = self.writer.lock().await;
        Ok(writer.write(packet).await?)
    }

    fn close(&self) -> Result<()> {
        debug!("[TUN] closing {}", self.name);
        self.closed.cancel();
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Tun
    }
}
