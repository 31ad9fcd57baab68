//! Portbridge service agent
//!
//! Runs next to the real target service: accepts incoming relay streams,
//! validates each stream's tunnel preamble against the listener's allowed
//! ports, and wires validated streams to tunnels that dial the target on
//! demand.

use portbridge_engine::{LocalChannelFactory, RelayTunnel, TcpChannelFactory};
use portbridge_proto::{CodecError, EndpointMetadata, MetadataError, TunnelPreamble};
use portbridge_transport::{RelayListener, RelayStream, TransportError};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Service agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid listener metadata: {0}")]
    Metadata(#[from] MetadataError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("preamble error: {0}")]
    Preamble(#[from] CodecError),
}

/// Accept loop over one relay listener
pub struct ServiceAgent {
    listener: Arc<dyn RelayListener>,
    endpoint: EndpointMetadata,
    factory: Arc<dyn LocalChannelFactory>,
    tunnels: Mutex<Vec<Arc<RelayTunnel>>>,
    shutdown: CancellationToken,
}

impl ServiceAgent {
    /// Parse the listener's user metadata once, at open. A malformed
    /// document is a configuration error and the agent does not start.
    pub fn new(listener: Arc<dyn RelayListener>) -> Result<Arc<Self>, AgentError> {
        Self::with_factory(listener, Arc::new(TcpChannelFactory))
    }

    pub fn with_factory(
        listener: Arc<dyn RelayListener>,
        factory: Arc<dyn LocalChannelFactory>,
    ) -> Result<Arc<Self>, AgentError> {
        let endpoint = EndpointMetadata::parse(listener.metadata())?;
        Ok(Arc::new(Self {
            listener,
            endpoint,
            factory,
            tunnels: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }))
    }

    pub fn endpoint(&self) -> &EndpointMetadata {
        &self.endpoint
    }

    pub fn active_tunnels(&self) -> usize {
        self.tunnels.lock().expect("tunnel list poisoned").len()
    }

    /// Accept relay streams until shutdown or the listener closes
    pub async fn run(self: &Arc<Self>) -> Result<(), AgentError> {
        info!(target_host = %self.endpoint.target_host, "service agent accepting relay streams");
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok(stream) => stream,
                Err(TransportError::ListenerClosed) => break,
                Err(e) => {
                    error!(error = %e, "relay listener failed");
                    break;
                }
            };
            let agent = self.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.handle_stream(stream).await {
                    warn!(error = %e, "relay stream refused");
                }
            });
        }
        info!("service agent stopped accepting");
        Ok(())
    }

    /// Validate one accepted stream's preamble and attach a tunnel.
    /// Violations close the stream without any local connection.
    async fn handle_stream(self: &Arc<Self>, mut stream: RelayStream) -> Result<(), AgentError> {
        let preamble = TunnelPreamble::read_from(&mut stream).await?;

        let port = match u16::try_from(preamble.configuration_key) {
            Ok(port) if port != 0 => port,
            _ => {
                warn!(
                    configuration_key = preamble.configuration_key,
                    "unparseable configuration key, refusing tunnel"
                );
                return Ok(());
            }
        };
        if !self.endpoint.allowed_ports.allows(port) {
            warn!(port, "target port not in allow-list, refusing tunnel");
            return Ok(());
        }

        let tunnel = RelayTunnel::for_accepted(
            stream,
            self.endpoint.target_host.clone(),
            port,
            self.factory.clone(),
        );
        tunnel.start().await;
        info!(port, tunnel = %tunnel.name(), "service tunnel started");

        self.tunnels
            .lock()
            .expect("tunnel list poisoned")
            .push(tunnel.clone());

        let agent = self.clone();
        tokio::spawn(async move {
            tunnel.wait_closed().await;
            agent
                .tunnels
                .lock()
                .expect("tunnel list poisoned")
                .retain(|t| !Arc::ptr_eq(t, &tunnel));
        });
        Ok(())
    }

    /// Stop accepting and close every active tunnel
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tunnels: Vec<Arc<RelayTunnel>> = self
            .tunnels
            .lock()
            .expect("tunnel list poisoned")
            .drain(..)
            .collect();
        for tunnel in tunnels {
            tunnel.close().await;
        }
    }
}
