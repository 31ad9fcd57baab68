//! Portbridge client agent
//!
//! Listens on local TCP ports and forwards each accepted connection
//! through a pooled relay tunnel toward the service-side agent. One
//! [`PortForwarder`] runs per configured port mapping.

pub mod config;

pub use config::{ClientConfig, ConfigError, PortMapping};

use portbridge_engine::{
    EngineError, FrameSink, LocalDataChannel, TunnelFactory, TunnelPool,
};
use portbridge_proto::{ConnectionId, FirewallError, FirewallRules};
use portbridge_transport::RelayConnector;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Client agent errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid firewall rule: {0}")]
    Firewall(#[from] FirewallError),

    #[error("failed to bind listener on {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

/// One local listener bridged to a pool of relay tunnels
pub struct PortForwarder {
    mapping: PortMapping,
    firewall: Arc<FirewallRules>,
    pool: Arc<TunnelPool>,
    shutdown: CancellationToken,
}

impl PortForwarder {
    /// Build a forwarder for one mapping. Firewall parse failures are
    /// configuration errors: the mapping is not started.
    pub fn new(
        mapping: PortMapping,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<Self, ClientError> {
        let firewall = Arc::new(FirewallRules::parse(&mapping.allowed_sources)?);
        let factory = TunnelFactory::new(
            mapping.entity_path.clone(),
            mapping.remote_configuration_key,
            connector,
            mapping.relay_connection_ttl(),
        );
        let pool = TunnelPool::new(factory, mapping.relay_channel_count);
        Ok(Self {
            mapping,
            firewall,
            pool,
            shutdown: CancellationToken::new(),
        })
    }

    /// Bind the local listener and spawn the accept loop. Returns the bound
    /// address (useful when the mapping asked for port 0).
    pub async fn start(&self) -> Result<SocketAddr, ClientError> {
        let bind = SocketAddr::new(self.mapping.bind_address, self.mapping.local_port);
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|source| ClientError::Bind {
                address: bind.to_string(),
                source,
            })?;
        let addr = listener.local_addr()?;
        info!(
            address = %addr,
            entity_path = %self.mapping.entity_path,
            configuration_key = self.mapping.remote_configuration_key,
            "port forwarder listening"
        );

        let firewall = self.firewall.clone();
        let pool = self.pool.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            Self::accept_loop(listener, firewall, pool, shutdown).await;
        });
        Ok(addr)
    }

    async fn accept_loop(
        listener: TcpListener,
        firewall: Arc<FirewallRules>,
        pool: Arc<TunnelPool>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer)) => {
                    if !firewall.is_socket_allowed(&peer) {
                        // Rejected sources are closed without any bytes.
                        warn!(%peer, "connection rejected by firewall");
                        drop(socket);
                        continue;
                    }
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        let connection_id = ConnectionId::new();
                        info!(%peer, connection_id = %connection_id, "local connection accepted");
                        let local = LocalDataChannel::new(socket);
                        let tunnel = pool.get();
                        if let Err(e) = tunnel
                            .ensure_relay_connection(local.clone(), connection_id)
                            .await
                        {
                            // This one attempt is dropped; the pool hands
                            // out a fresh tunnel on the next accept.
                            warn!(
                                connection_id = %connection_id,
                                error = %e,
                                "failed to attach connection to relay tunnel"
                            );
                            local.shutdown().await;
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "listener accept failed");
                }
            }
        }
        info!("port forwarder stopped accepting");
    }

    /// Cooperative shutdown: stop accepting, then close every tunnel
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }

    pub fn mapping(&self) -> &PortMapping {
        &self.mapping
    }
}
