//! Portbridge client agent CLI
//!
//! Forwards local TCP connections through a relay toward a service-side
//! agent. Mappings come from a JSON config file or from flags describing a
//! single mapping.

use anyhow::{bail, Context, Result};
use clap::Parser;
use portbridge_client::{ClientConfig, PortForwarder, PortMapping};
use portbridge_transport::TcpRelayConnector;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portbridge client agent - forwards local TCP ports across a relay
#[derive(Parser, Debug)]
#[command(name = "portbridge-client")]
#[command(about = "Forwards local TCP connections through a relay to a remote service")]
#[command(version)]
struct Args {
    /// Relay address (e.g. relay.example.com:9443)
    #[arg(long, env = "PORTBRIDGE_RELAY")]
    relay: String,

    /// Relay authorization token
    #[arg(long, env = "PORTBRIDGE_TOKEN")]
    token: String,

    /// Configuration file (JSON) with port mappings
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Local port to listen on (single-mapping mode)
    #[arg(long)]
    local_port: Option<u16>,

    /// Address to bind the local listener to
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: IpAddr,

    /// Relay entity path (single-mapping mode)
    #[arg(long)]
    entity_path: Option<String>,

    /// Target port on the service side (single-mapping mode)
    #[arg(long)]
    target_port: Option<i32>,

    /// Allowed source IPs or ranges; repeatable (default: allow all)
    #[arg(long = "allow")]
    allowed_sources: Vec<String>,

    /// Relay tunnels kept active per mapping
    #[arg(long, default_value_t = 1)]
    channels: usize,

    /// Relay tunnel accept-TTL in seconds
    #[arg(long, default_value_t = 300)]
    ttl_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn setup_logging(log_level: &str) -> Result<()> {
    let filter =
        EnvFilter::try_new(log_level).with_context(|| format!("invalid log level: {}", log_level))?;
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
    Ok(())
}

fn build_config(args: &Args) -> Result<ClientConfig> {
    if let Some(path) = &args.config {
        return Ok(ClientConfig::load(path)?);
    }

    let (Some(local_port), Some(entity_path), Some(target_port)) =
        (args.local_port, args.entity_path.clone(), args.target_port)
    else {
        bail!("either --config or all of --local-port, --entity-path and --target-port are required");
    };

    Ok(ClientConfig {
        mappings: vec![PortMapping {
            local_port,
            bind_address: args.bind_address,
            entity_path,
            remote_configuration_key: target_port,
            allowed_sources: args.allowed_sources.clone(),
            relay_channel_count: args.channels,
            relay_connection_ttl_secs: args.ttl_secs,
        }],
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    let config = build_config(&args)?;
    if config.mappings.is_empty() {
        bail!("no port mappings configured");
    }

    let connector = Arc::new(TcpRelayConnector::new(args.relay.clone(), args.token.clone()));

    let mut forwarders = Vec::new();
    for mapping in config.mappings {
        let local_port = mapping.local_port;
        match PortForwarder::new(mapping, connector.clone()) {
            Ok(forwarder) => {
                forwarder
                    .start()
                    .await
                    .with_context(|| format!("failed to start mapping on port {}", local_port))?;
                forwarders.push(forwarder);
            }
            Err(e) => {
                // A misconfigured mapping is reported and skipped; the
                // others still run.
                error!(local_port, error = %e, "mapping not started");
            }
        }
    }
    if forwarders.is_empty() {
        bail!("no mappings could be started");
    }

    info!(mappings = forwarders.len(), "portbridge client running");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for forwarder in &forwarders {
        forwarder.stop().await;
    }
    Ok(())
}
