//! Frame dispatcher
//!
//! Routes inbound frames, keyed by connection id, to the right per
//! connection frame queue. The client side registers queues explicitly
//! when it accepts a local connection; the service side lazily creates
//! them through a correlation callback that dials the real target on the
//! first frame of a new connection.

use crate::error::EngineError;
use crate::frame_queue::{CompletionCallback, FrameQueue, FrameSink};
use crate::local_channel::LocalDataChannel;
use futures::future::BoxFuture;
use portbridge_proto::{ConnectionId, Frame};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Service-side callback: dial the target for a brand-new connection id and
/// hand back the writer to register. Implementations also spawn the
/// connection's uplink pump.
pub type CorrelationCallback = Arc<
    dyn Fn(ConnectionId) -> BoxFuture<'static, Result<Arc<LocalDataChannel>, EngineError>>
        + Send
        + Sync,
>;

/// Demultiplexes one relay stream's frames into per-connection queues
pub struct FrameDispatcher {
    queues: Mutex<HashMap<ConnectionId, Arc<FrameQueue>>>,
    correlate: Option<CorrelationCallback>,
}

impl FrameDispatcher {
    /// Client-side dispatcher: unknown connection ids are dropped (their
    /// local connection already closed)
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            correlate: None,
        }
    }

    /// Service-side dispatcher with dial-on-demand correlation
    pub fn with_correlation(correlate: CorrelationCallback) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            correlate: Some(correlate),
        }
    }

    /// Register a queue for a known connection id (client side, where the
    /// id exists before any relay frame arrives)
    pub fn add_queue(
        self: &Arc<Self>,
        connection_id: ConnectionId,
        writer: Arc<dyn FrameSink>,
    ) -> Arc<FrameQueue> {
        let dispatcher = Arc::downgrade(self);
        let on_complete: CompletionCallback = Arc::new(move |id| {
            // Teardown must not run inside the drain loop that triggered it.
            if let Some(dispatcher) = dispatcher.upgrade() {
                tokio::spawn(async move {
                    dispatcher.remove_queue(id).await;
                });
            }
        });
        let queue = FrameQueue::new(connection_id, writer, on_complete);
        self.queues
            .lock()
            .expect("dispatcher map poisoned")
            .insert(connection_id, queue.clone());
        queue
    }

    /// Route one inbound frame. Enqueueing is synchronous so that frames
    /// for one connection keep their relay-stream order; delivery itself is
    /// spawned so a slow endpoint never gates relay reads.
    pub async fn dispatch(self: &Arc<Self>, frame: Frame) {
        let connection_id = frame.connection_id;
        let existing = self
            .queues
            .lock()
            .expect("dispatcher map poisoned")
            .get(&connection_id)
            .cloned();

        let queue = match existing {
            Some(queue) => queue,
            // A sentinel for an unknown id is the tail end of a connection
            // already torn down on this side; correlating would dial the
            // target for a dead connection.
            None if frame.is_sentinel() => {
                debug!(
                    connection_id = %connection_id,
                    "sentinel for unknown connection dropped"
                );
                return;
            }
            None => match &self.correlate {
                Some(correlate) => match correlate(connection_id).await {
                    Ok(writer) => self.add_queue(connection_id, writer),
                    Err(e) => {
                        warn!(
                            connection_id = %connection_id,
                            error = %e,
                            "failed to correlate new connection, dropping frame"
                        );
                        return;
                    }
                },
                None => {
                    warn!(
                        connection_id = %connection_id,
                        "frame for unknown connection dropped"
                    );
                    return;
                }
            },
        };

        queue.enqueue(frame);
        tokio::spawn(async move {
            queue.drain().await;
        });
    }

    /// Remove and shut down one connection's queue, if still present
    pub async fn remove_queue(&self, connection_id: ConnectionId) {
        let queue = self
            .queues
            .lock()
            .expect("dispatcher map poisoned")
            .remove(&connection_id);
        if let Some(queue) = queue {
            queue.shutdown().await;
            debug!(connection_id = %connection_id, "connection removed from dispatcher");
        }
    }

    /// Remove and shut down every queue; used when the relay stream closes
    /// to cascade-close all connections it carried
    pub async fn clear(&self) {
        let queues: Vec<Arc<FrameQueue>> = self
            .queues
            .lock()
            .expect("dispatcher map poisoned")
            .drain()
            .map(|(_, queue)| queue)
            .collect();
        for queue in queues {
            queue.shutdown().await;
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().expect("dispatcher map poisoned").len()
    }
}

impl Default for FrameDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
