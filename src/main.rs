//! # quay
//!
//! Proxy binary: loads config, installs logging and serves the WebSocket front end.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use quay_server::{load_config, ProxyConfig};

/// Messaging proxy that fronts a legacy broker for WebSocket clients.
#[derive(Parser, Debug)]
#[command(name = "quay", about = "Messaging proxy server")]
struct Cli {
    /// JSON config file. Missing files fall back to defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides config).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides config).
    #[arg(long)]
    port: Option<u16>,
}

impl Cli {
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    cli.apply(&mut config);

    let _telemetry = quay_telemetry::init_telemetry(&config.telemetry).context("Failed to initialize logging")?;

    let handle = quay_server::start(config)
        .await
        .context("Failed to bind server")?;
    tracing::info!("quay listening on {}", handle.local_addr);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    handle.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults_leave_config_alone() {
        let cli = Cli::parse_from(["quay"]);
        let mut config = ProxyConfig::default();
        cli.apply(&mut config);
        assert_eq!(config, ProxyConfig::default());
        assert!(cli.config.is_none());
    }

    #[test]
    fn cli_overrides_host_and_port() {
        let cli = Cli::parse_from(["quay", "--host", "127.0.0.1", "--port", "0", "--config", "/tmp/quay.json"]);
        let mut config = ProxyConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/quay.json")));
    }
}
