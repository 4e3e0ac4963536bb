//! cftun - userspace TUN client for a WebSocket edge

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cftun::app::Runtime;
use cftun::config::Config;
use cftun::error::{Error, Result};

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "cftun", disable_version_flag = true)]
#[command(about = "Userspace TUN client relaying captured flows to a WebSocket edge")]
#[command(after_help = "SIGNALS:\n    SIGHUP    Reload edge settings from the config file\n\n\
METRICS:\n    GET /metrics    Prometheus metrics (when --api or api.listen is set)")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "./config.json")]
    config: PathBuf,

    /// Print an example client config and exit
    #[arg(long)]
    gen_config: bool,

    /// Metrics listen address (e.g., 127.0.0.1:9090)
    #[arg(long = "api", value_name = "ADDR")]
    api_listen: Option<String>,

    /// Print version information
    #[arg(short = 'v', long)]
    version: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.version {
        print_version();
        return Ok(());
    }

    if args.gen_config {
        let json = serde_json::to_string_pretty(&Config::default_client())
            .map_err(|e| Error::Config(e.to_string()))?;
        println!("{}", json);
        return Ok(());
    }

    let config = Config::load(&args.config)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| Error::Config(format!("Failed to set tracing subscriber: {}", e)))?;

    info!("cftun v{} starting...", env!("CARGO_PKG_VERSION"));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let runtime = Runtime::new(config, Some(args.config)).with_api_listen(args.api_listen);
        runtime.run().await
    })?;

    info!("Goodbye!");
    Ok(())
}

fn print_version() {
    println!("cftun v{}", env!("CARGO_PKG_VERSION"));
    println!("Userspace TUN client for a WebSocket edge");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["cftun"]);
        assert_eq!(args.config, PathBuf::from("./config.json"));
        assert!(!args.gen_config);
        assert!(args.api_listen.is_none());
    }

    #[test]
    fn test_args_overrides() {
        let args = Args::parse_from(["cftun", "-c", "/etc/cftun.json", "--api", "127.0.0.1:9090", "-v"]);
        assert_eq!(args.config, PathBuf::from("/etc/cftun.json"));
        assert_eq!(args.api_listen.as_deref(), Some("127.0.0.1:9090"));
        assert!(args.version);
    }
}
