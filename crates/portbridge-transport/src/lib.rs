//! Relay transport abstraction
//!
//! The tunneling engine treats the relay purely as a factory of long-lived
//! bidirectional byte streams with a token-based authorization step. This
//! crate defines that seam — [`RelayConnector`] on the dialing side and
//! [`RelayListener`] on the accepting side — plus two implementations: a
//! plain-TCP relay for development and tests, and an in-process pair for
//! loopback tests.

pub mod mem;
pub mod tcp;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mem::{memory_relay, MemoryRelayConnector, MemoryRelayListener};
pub use tcp::{TcpRelayConnector, TcpRelayListener};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("relay rejected authorization: {0}")]
    AuthorizationRejected(String),

    #[error("relay handshake failed: {0}")]
    Handshake(String),

    #[error("relay listener closed")]
    ListenerClosed,
}

/// Marker trait for the byte-stream halves a relay hands out
pub trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayIo for T {}

/// One long-lived bidirectional relay byte stream
pub type RelayStream = Box<dyn RelayIo>;

/// Dial-side relay stream factory (client agent)
#[async_trait]
pub trait RelayConnector: Send + Sync {
    /// Open a new relay stream to the named entity path, performing the
    /// transport's authorization step
    async fn open(&self, entity_path: &str) -> Result<RelayStream, TransportError>;
}

/// Accept-side relay stream factory (service agent)
#[async_trait]
pub trait RelayListener: Send + Sync {
    /// The relay-supplied user metadata document, read once at listener open
    fn metadata(&self) -> &str;

    /// Wait for the next incoming relay stream
    async fn accept(&self) -> Result<RelayStream, TransportError>;
}
