//! Local endpoint data channel
//!
//! Wraps one TCP socket on the local side of a tunnel: either accepted by
//! the client agent's listener, or dialed by the service agent toward the
//! real target. Reads feed the uplink pump; writes come from the frame
//! queue's serialized drain, so neither half sees concurrent use.

use crate::error::EngineError;
use crate::frame_queue::FrameSink;
use crate::metrics::ChannelMetrics;
use async_trait::async_trait;
use portbridge_proto::Frame;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One local TCP socket translated to/from frames
pub struct LocalDataChannel {
    peer: String,
    read_half: Mutex<OwnedReadHalf>,
    write_half: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
    metrics: ChannelMetrics,
}

impl LocalDataChannel {
    pub fn new(stream: TcpStream) -> Arc<Self> {
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        Arc::new(Self {
            peer,
            read_half: Mutex::new(read_half),
            write_half: Mutex::new(write_half),
            closed: CancellationToken::new(),
            metrics: ChannelMetrics::new(),
        })
    }

    /// Remote address of the wrapped socket, for logging
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// One socket read into the caller's buffer. Returns 0 on local EOF or
    /// after the channel has been shut down, which unblocks a pump parked
    /// on a dead connection's read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, EngineError> {
        let mut half = self.read_half.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(0),
            result = half.read(buf) => match result {
                Ok(n) => {
                    self.metrics.record_read(n);
                    Ok(n)
                }
                Err(e) => {
                    self.metrics.record_failure();
                    Err(e.into())
                }
            },
        }
    }
}

#[async_trait]
impl FrameSink for LocalDataChannel {
    async fn write_frame(&self, frame: &Frame) -> Result<(), EngineError> {
        // The sentinel carries no payload; teardown is the caller's move.
        if frame.is_sentinel() {
            return Ok(());
        }

        let mut half = self.write_half.lock().await;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(EngineError::ChannelClosed),
            result = half.write_all(&frame.payload) => result.map_err(EngineError::from),
        };
        match result {
            Ok(()) => {
                self.metrics.record_write(frame.size());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                Err(e)
            }
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        // Best effort: a socket that already failed will fail to close too.
        let _ = self.write_half.lock().await.shutdown().await;
        debug!(peer = %self.peer, metrics = ?self.metrics.snapshot(), "local channel closed");
    }
}

/// Factory seam for dialing local data channels (service side). TCP is the
/// only production implementation; alternate transports slot in without
/// touching the dispatcher.
#[async_trait]
pub trait LocalChannelFactory: Send + Sync {
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<LocalDataChannel>, EngineError>;
}

/// Dials plain TCP connections to the target endpoint
#[derive(Debug, Default)]
pub struct TcpChannelFactory;

#[async_trait]
impl LocalChannelFactory for TcpChannelFactory {
    async fn dial(&self, host: &str, port: u16) -> Result<Arc<LocalDataChannel>, EngineError> {
        let stream = TcpStream::connect((host, port)).await?;
        Ok(LocalDataChannel::new(stream))
    }
}
