//! Per-connection frame queue
//!
//! Guarantees ordered, non-concurrent delivery of frames to one destination
//! writer despite concurrent producers. Producers enqueue; whichever caller
//! wins the drain gate delivers every currently-queued frame (including
//! ones enqueued by losers), so no frame is ever silently stuck and the
//! writer is never invoked concurrently.

use crate::error::EngineError;
use async_trait::async_trait;
use portbridge_proto::{ConnectionId, Frame};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Destination writer seam for a frame queue.
///
/// The only production implementation is the local TCP data channel; tests
/// substitute recording sinks.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Write one frame's payload to the destination endpoint. A sentinel
    /// frame must perform no write.
    async fn write_frame(&self, frame: &Frame) -> Result<(), EngineError>;

    /// Close the destination endpoint, swallowing close errors
    async fn shutdown(&self);
}

/// Fired exactly once when a queue's connection is torn down
pub type CompletionCallback = Arc<dyn Fn(ConnectionId) + Send + Sync>;

/// Ordered single-consumer delivery queue for one logical connection
pub struct FrameQueue {
    connection_id: ConnectionId,
    writer: Arc<dyn FrameSink>,
    pending: StdMutex<VecDeque<Frame>>,
    drain_gate: Mutex<()>,
    completed: AtomicBool,
    on_complete: CompletionCallback,
}

impl FrameQueue {
    pub fn new(
        connection_id: ConnectionId,
        writer: Arc<dyn FrameSink>,
        on_complete: CompletionCallback,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection_id,
            writer,
            pending: StdMutex::new(VecDeque::new()),
            drain_gate: Mutex::new(()),
            completed: AtomicBool::new(false),
            on_complete,
        })
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Enqueue then drain, awaiting delivery of everything queued so far
    pub async fn process(&self, frame: Frame) {
        self.enqueue(frame);
        self.drain().await;
    }

    /// Append a frame; delivery order is enqueue order
    pub fn enqueue(&self, frame: Frame) {
        self.pending.lock().expect("frame queue poisoned").push_back(frame);
    }

    /// Deliver queued frames FIFO. Overlapping callers serialize on the
    /// drain gate: losers return immediately, the winner also delivers
    /// their frames.
    pub async fn drain(&self) {
        loop {
            let Ok(gate) = self.drain_gate.try_lock() else {
                // Another caller is draining and will pick our frames up.
                return;
            };
            while let Some(frame) = self.pop() {
                self.deliver(frame).await;
            }
            drop(gate);
            // A producer may have enqueued between the last pop and the
            // gate release; take another pass rather than strand it.
            if self.pending.lock().expect("frame queue poisoned").is_empty() {
                return;
            }
        }
    }

    fn pop(&self) -> Option<Frame> {
        self.pending.lock().expect("frame queue poisoned").pop_front()
    }

    async fn deliver(&self, frame: Frame) {
        if self.completed.load(Ordering::Acquire) {
            // Endpoint already torn down; late frames are discarded.
            return;
        }

        let mut complete_write_back = frame.is_sentinel();
        if !complete_write_back {
            if let Err(e) = self.writer.write_frame(&frame).await {
                if is_expected_churn(&e) {
                    info!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "endpoint reset, completing connection"
                    );
                } else {
                    error!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "endpoint write failed, completing connection"
                    );
                }
                complete_write_back = true;
            }
        }

        if complete_write_back {
            self.complete();
        }
    }

    /// Latch completion; the callback fires at most once no matter how many
    /// frames fail concurrently
    fn complete(&self) {
        if !self.completed.swap(true, Ordering::AcqRel) {
            debug!(connection_id = %self.connection_id, "frame queue completed");
            (self.on_complete)(self.connection_id);
        }
    }

    /// Dispatcher-initiated teardown: discard pending frames and close the
    /// destination without re-firing the completion callback
    pub async fn shutdown(&self) {
        self.completed.store(true, Ordering::Release);
        self.pending.lock().expect("frame queue poisoned").clear();
        self.writer.shutdown().await;
    }
}

/// Connection reset/aborted class errors are expected churn, logged at
/// informational level rather than as failures
fn is_expected_churn(err: &EngineError) -> bool {
    match err {
        EngineError::ChannelClosed => true,
        EngineError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::Interrupted
        ),
        _ => false,
    }
}
