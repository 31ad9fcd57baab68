//! Portbridge service agent CLI
//!
//! Accepts relay streams and bridges them to a target service reachable
//! from this host.

use anyhow::{Context, Result};
use clap::Parser;
use portbridge_agent::ServiceAgent;
use portbridge_proto::EndpointMetadata;
use portbridge_transport::TcpRelayListener;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Portbridge service agent - bridges relay streams to a local target
#[derive(Parser, Debug)]
#[command(name = "portbridge-agent")]
#[command(about = "Accepts relay streams and forwards them to the target service")]
#[command(version)]
struct Args {
    /// Address to accept relay connections on (e.g. 0.0.0.0:9443)
    #[arg(long, env = "PORTBRIDGE_LISTEN")]
    listen: SocketAddr,

    /// Relay authorization token
    #[arg(long, env = "PORTBRIDGE_TOKEN")]
    token: String,

    /// Endpoint this agent bridges to: `<host>:<allowed-ports>` where
    /// allowed-ports is `*` or a comma-separated list (e.g. `db.internal:5011,5432`)
    #[arg(long, env = "PORTBRIDGE_ENDPOINT")]
    endpoint: String,

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

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level)?;

    // Validate the endpoint up front so a typo fails fast, then publish it
    // as the listener's metadata document.
    let endpoint = EndpointMetadata::parse_endpoint_value(&args.endpoint)
        .with_context(|| format!("invalid --endpoint value '{}'", args.endpoint))?;
    let metadata = endpoint.to_document();

    let listener = TcpRelayListener::bind(args.listen, args.token.clone(), metadata)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", args.listen))?;
    info!(listen = %args.listen, target_host = %endpoint.target_host, "relay listener open");

    let agent = ServiceAgent::new(Arc::new(listener))?;

    let runner = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run().await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    agent.shutdown().await;
    runner.abort();
    Ok(())
}
