//! In-process relay transport
//!
//! Pairs a connector and a listener over in-memory duplex pipes. Used by
//! tests to run a full client↔service loop without sockets.

use crate::{RelayConnector, RelayListener, RelayStream, TransportError};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

const PIPE_CAPACITY: usize = 256 * 1024;

/// Dial side of an in-process relay pair
pub struct MemoryRelayConnector {
    tx: mpsc::UnboundedSender<RelayStream>,
}

/// Accept side of an in-process relay pair
pub struct MemoryRelayListener {
    rx: Mutex<mpsc::UnboundedReceiver<RelayStream>>,
    metadata: String,
}

/// Create a connected connector/listener pair with the given listener metadata
pub fn memory_relay(metadata: impl Into<String>) -> (MemoryRelayConnector, MemoryRelayListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryRelayConnector { tx },
        MemoryRelayListener {
            rx: Mutex::new(rx),
            metadata: metadata.into(),
        },
    )
}

#[async_trait]
impl RelayConnector for MemoryRelayConnector {
    async fn open(&self, _entity_path: &str) -> Result<RelayStream, TransportError> {
        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        self.tx
            .send(Box::new(far))
            .map_err(|_| TransportError::ListenerClosed)?;
        Ok(Box::new(near))
    }
}

#[async_trait]
impl RelayListener for MemoryRelayListener {
    fn metadata(&self) -> &str {
        &self.metadata
    }

    async fn accept(&self) -> Result<RelayStream, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ListenerClosed)
    }
}
