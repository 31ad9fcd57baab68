//! Uplink and downlink pumps
//!
//! A pump is the continuous read loop moving data in one direction for one
//! channel. One uplink pump runs per local TCP connection; one downlink
//! pump runs per relay stream. Pump failures are terminal for that pump
//! only: they are logged, cleanup runs unconditionally, and the process
//! never crashes because of them.

use crate::dispatcher::FrameDispatcher;
use crate::frame_queue::FrameSink;
use crate::local_channel::LocalDataChannel;
use crate::relay_channel::RelayDataChannel;
use portbridge_proto::{ConnectionId, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reads one local TCP connection and frames it onto the relay
pub struct UplinkPump {
    connection_id: ConnectionId,
    local: Arc<LocalDataChannel>,
    relay: Arc<RelayDataChannel>,
    dispatcher: Arc<FrameDispatcher>,
    stop: Arc<AtomicBool>,
}

impl UplinkPump {
    pub fn new(
        connection_id: ConnectionId,
        local: Arc<LocalDataChannel>,
        relay: Arc<RelayDataChannel>,
        dispatcher: Arc<FrameDispatcher>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            connection_id,
            local,
            relay,
            dispatcher,
            stop,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        // Payload is read directly behind reserved header space so each
        // frame goes out as a single relay write.
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + MAX_FRAME_SIZE];
        loop {
            let n = match self.local.read(&mut buf[FRAME_HEADER_SIZE..]).await {
                Ok(0) => {
                    debug!(connection_id = %self.connection_id, "local endpoint closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "local read failed, ending uplink"
                    );
                    break;
                }
            };

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            if let Err(e) = self
                .relay
                .write_frame(self.connection_id, &mut buf, n)
                .await
            {
                warn!(
                    connection_id = %self.connection_id,
                    error = %e,
                    "relay write failed, ending uplink"
                );
                break;
            }
        }

        // Completion runs on every exit path: tell the peer (unless the
        // whole tunnel is going down), close the local socket, and drop the
        // dispatcher state for this connection.
        if !self.stop.load(Ordering::Acquire) {
            let _ = self.relay.write_sentinel(self.connection_id).await;
        }
        self.local.shutdown().await;
        self.dispatcher.remove_queue(self.connection_id).await;
        debug!(connection_id = %self.connection_id, "uplink pump finished");
    }
}

/// Reads one relay stream and dispatches its frames
pub struct DownlinkPump {
    relay: Arc<RelayDataChannel>,
    dispatcher: Arc<FrameDispatcher>,
    stop: Arc<AtomicBool>,
}

impl DownlinkPump {
    pub fn new(
        relay: Arc<RelayDataChannel>,
        dispatcher: Arc<FrameDispatcher>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            relay,
            dispatcher,
            stop,
        }
    }

    /// Run until the relay stream ends, a stop is requested, or a read
    /// fails. The caller owns what happens next (tunnel teardown).
    pub async fn run(self) {
        loop {
            let frame = match self.relay.read_frame().await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("relay stream closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "relay read failed, ending downlink");
                    break;
                }
            };

            if self.stop.load(Ordering::Acquire) {
                break;
            }

            // Dispatch enqueues in read order and hands delivery to the
            // queue; the pump goes straight back to the relay socket.
            self.dispatcher.dispatch(frame).await;
        }
        debug!(
            metrics = ?self.relay.metrics().snapshot(),
            "downlink pump finished"
        );
    }
}
