//! Configuration module for cftun
//!
//! JSON configuration with kebab-case keys. Every section has defaults, so a
//! minimal file only needs `argo.url`.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::device::{DeviceUrl, TunOptions};
use crate::error::{Error, Result};
use crate::transport::ArgoOptions;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Metrics endpoint
    #[serde(default)]
    pub api: Option<ApiConfig>,

    /// Virtual interface
    #[serde(default)]
    pub tun: TunConfig,

    /// Edge endpoint and pool
    #[serde(default)]
    pub argo: ArgoConfig,

    /// UDP session table
    #[serde(default)]
    pub udp: UdpConfig,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Listen address for the metrics endpoint (e.g., "127.0.0.1:9090")
    pub listen: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file {}: {}", path.display(), e)))?;
        if content.trim().is_empty() {
            return Err(Error::Config(format!("Config file {} is empty", path.display())));
        }
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.argo.url.trim().is_empty() {
            return Err(Error::Config("argo.url must not be empty".into()));
        }
        if !matches!(self.argo.scheme.to_ascii_lowercase().as_str(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "argo.scheme must be ws or wss, got {:?}",
                self.argo.scheme
            )));
        }
        if self.tun.mtu == 0 {
            return Err(Error::Config("tun.mtu must be greater than zero".into()));
        }
        if self.udp.timeout_secs == 0 {
            return Err(Error::Config("udp.timeout-secs must be greater than zero".into()));
        }
        self.device_url()?;
        Ok(())
    }

    /// Create a default client configuration
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            api: Some(ApiConfig {
                listen: "127.0.0.1:9090".to_string(),
            }),
            tun: TunConfig {
                address: Some(Ipv4Addr::new(198, 18, 0, 1)),
                netmask: Some(Ipv4Addr::new(255, 255, 0, 0)),
                ..TunConfig::default()
            },
            argo: ArgoConfig {
                url: "tunnel.example.com/ws".to_string(),
                ..ArgoConfig::default()
            },
            udp: UdpConfig::default(),
        }
    }

    /// Device URL, from `tun.device` or derived from `tun.name`
    pub fn device_url(&self) -> Result<DeviceUrl> {
        match self.tun.device.as_deref().filter(|d| !d.is_empty()) {
            Some(device) => DeviceUrl::parse(device),
            None => DeviceUrl::parse(&self.tun.name),
        }
    }

    pub fn tun_options(&self) -> TunOptions {
        TunOptions {
            mtu: self.tun.mtu,
            address: self.tun.address,
            netmask: self.tun.netmask,
        }
    }

    pub fn argo_options(&self) -> ArgoOptions {
        ArgoOptions {
            scheme: self.argo.scheme.clone(),
            url: self.argo.url.clone(),
            cdn_ip: self.argo.cdn_ip.clone(),
            port: self.argo.port,
            handshake_timeout: Duration::from_secs(self.argo.handshake_timeout_secs.max(1)),
            allow_insecure: self.argo.allow_insecure,
            interface: self.tun.interface.clone(),
        }
    }

    /// Pooled connections older than this are discarded; `None` keeps them forever
    pub fn max_idle(&self) -> Option<Duration> {
        match self.argo.max_idle_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp.timeout_secs)
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// TUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TunConfig {
    /// Device URL such as `tun://cftun0`; overrides `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    /// Interface name
    #[serde(default = "default_tun_name")]
    pub name: String,

    #[serde(default = "default_mtu")]
    pub mtu: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<Ipv4Addr>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub netmask: Option<Ipv4Addr>,

    /// Bind edge connections to this interface (Linux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
}

fn default_tun_name() -> String {
    "cftun0".to_string()
}

fn default_mtu() -> u16 {
    1500
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            device: None,
            name: default_tun_name(),
            mtu: default_mtu(),
            address: None,
            netmask: None,
            interface: None,
        }
    }
}

/// Edge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ArgoConfig {
    /// `ws` or `wss`
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// `host[/path]`
    #[serde(default)]
    pub url: String,

    /// Connect to this address instead of resolving the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdn_ip: Option<String>,

    /// Port used together with `cdn-ip`
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pre-dialed connections kept ready
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,

    #[serde(default)]
    pub allow_insecure: bool,

    /// Discard pooled connections older than this (0 disables)
    #[serde(default = "default_max_idle")]
    pub max_idle_secs: u64,
}

fn default_scheme() -> String {
    "wss".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_pool_size() -> usize {
    10
}

fn default_handshake_timeout() -> u64 {
    1
}

fn default_max_idle() -> u64 {
    90
}

impl Default for ArgoConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            url: String::new(),
            cdn_ip: None,
            port: default_port(),
            pool_size: default_pool_size(),
            handshake_timeout_secs: default_handshake_timeout(),
            allow_insecure: false,
            max_idle_secs: default_max_idle(),
        }
    }
}

/// UDP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UdpConfig {
    /// Idle timeout of a UDP session
    #[serde(default = "default_udp_timeout")]
    pub timeout_secs: u64,
}

fn default_udp_timeout() -> u64 {
    60
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_udp_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKind;

    #[test]
    fn test_default_client_config() {
        let config = Config::default_client();
        config.validate().unwrap();
        assert_eq!(config.tun.name, "cftun0");
        assert_eq!(config.argo.pool_size, 10);
        assert_eq!(config.udp_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        assert!(json.contains("\"pool-size\""));
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.argo.url, config.argo.url);
        assert_eq!(parsed.tun.address, config.tun.address);
    }

    #[test]
    fn test_minimal_config() {
        let config = Config::from_json(
            r#"{
                "tun": { "device": "tun://utun9", "mtu": 1400, "interface": "eth0" },
                "argo": {
                    "scheme": "ws",
                    "url": "edge.example.com/path",
                    "cdn-ip": "104.16.0.1",
                    "port": 8080,
                    "max-idle-secs": 0
                },
                "udp": { "timeout-secs": 30 }
            }"#,
        )
        .unwrap();

        let url = config.device_url().unwrap();
        assert_eq!(url.kind, DeviceKind::Tun);
        assert_eq!(url.name, "utun9");
        assert_eq!(config.max_idle(), None);
        assert_eq!(config.udp_timeout(), Duration::from_secs(30));

        let argo = config.argo_options();
        assert_eq!(argo.cdn_ip.as_deref(), Some("104.16.0.1"));
        assert_eq!(argo.port, 8080);
        assert_eq!(argo.interface.as_deref(), Some("eth0"));
        assert_eq!(argo.handshake_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        assert!(matches!(Config::from_json("{}"), Err(Error::Config(_))));

        let mut config = Config::default_client();
        config.argo.scheme = "http".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default_client();
        config.tun.mtu = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default_client();
        config.tun.device = Some("tap://tap0".to_string());
        assert!(config.validate().is_err());
    }
}
