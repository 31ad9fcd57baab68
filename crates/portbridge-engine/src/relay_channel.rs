//! Relay data channel
//!
//! Wraps one relay byte stream. Reads are single-consumer (only the
//! downlink pump). Writes are shared by every uplink pump on the tunnel
//! and serialized behind a channel-scoped lock: the relay stream has no
//! atomic multi-segment write, so two interleaved writers would corrupt
//! the framing.

use crate::error::EngineError;
use crate::metrics::ChannelMetrics;
use portbridge_proto::{
    read_frame, stamp_frame_header, ConnectionId, Frame, TunnelPreamble, FRAME_HEADER_SIZE,
    MAX_FRAME_SIZE,
};
use portbridge_transport::RelayStream;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// One relay stream, split for a single reader and serialized writers
pub struct RelayDataChannel {
    reader: Mutex<ReadHalf<RelayStream>>,
    writer: Mutex<WriteHalf<RelayStream>>,
    metrics: ChannelMetrics,
}

impl RelayDataChannel {
    pub fn new(stream: RelayStream) -> Arc<Self> {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new(Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            metrics: ChannelMetrics::new(),
        })
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.metrics
    }

    /// Send the tunnel preamble; called once, before any frame
    pub async fn write_preamble(&self, preamble: &TunnelPreamble) -> Result<(), EngineError> {
        let mut writer = self.writer.lock().await;
        preamble.write_to(&mut *writer).await.map_err(|e| {
            self.metrics.record_failure();
            EngineError::from(e)
        })
    }

    /// Read the next frame; `None` means the relay stream closed cleanly
    pub async fn read_frame(&self) -> Result<Option<Frame>, EngineError> {
        let mut reader = self.reader.lock().await;
        match read_frame(&mut *reader).await {
            Ok(Some(frame)) => {
                self.metrics.record_read(frame.size());
                Ok(Some(frame))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.metrics.record_failure();
                Err(e.into())
            }
        }
    }

    /// Write one frame whose payload already sits in `buf` after
    /// [`FRAME_HEADER_SIZE`] reserved bytes. The header is stamped into the
    /// reserved space and header + payload go out as a single locked write.
    pub async fn write_frame(
        &self,
        connection_id: ConnectionId,
        buf: &mut [u8],
        len: usize,
    ) -> Result<(), EngineError> {
        debug_assert!(buf.len() >= FRAME_HEADER_SIZE + len);
        if len > MAX_FRAME_SIZE {
            return Err(EngineError::Codec(
                portbridge_proto::CodecError::PayloadTooLarge(len),
            ));
        }
        stamp_frame_header(buf, connection_id, len as u16);

        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&buf[..FRAME_HEADER_SIZE + len]).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                self.metrics.record_write(len);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                Err(e.into())
            }
        }
    }

    /// Send the zero-size close sentinel for a connection
    pub async fn write_sentinel(&self, connection_id: ConnectionId) -> Result<(), EngineError> {
        let header = Frame::sentinel(connection_id).encode();
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(&header).await?;
            writer.flush().await
        }
        .await;
        match result {
            Ok(()) => {
                self.metrics.record_write(0);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_failure();
                Err(e.into())
            }
        }
    }

    /// Close the write side; the peer's reader then sees a clean end
    pub async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn channel_pair() -> (Arc<RelayDataChannel>, Arc<RelayDataChannel>) {
        let (near, far) = tokio::io::duplex(256 * 1024);
        (
            RelayDataChannel::new(Box::new(near)),
            RelayDataChannel::new(Box::new(far)),
        )
    }

    #[tokio::test]
    async fn test_frame_roundtrip_over_channel() {
        let (near, far) = channel_pair();
        let id = ConnectionId::new();

        let mut buf = vec![0u8; FRAME_HEADER_SIZE + 5];
        buf[FRAME_HEADER_SIZE..].copy_from_slice(b"hello");
        near.write_frame(id, &mut buf, 5).await.unwrap();

        let frame = far.read_frame().await.unwrap().unwrap();
        assert_eq!(frame.connection_id, id);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_sentinel_roundtrip_over_channel() {
        let (near, far) = channel_pair();
        let id = ConnectionId::new();

        near.write_sentinel(id).await.unwrap();
        let frame = far.read_frame().await.unwrap().unwrap();
        assert!(frame.is_sentinel());
        assert_eq!(frame.connection_id, id);
    }

    #[tokio::test]
    async fn test_clean_close_reads_none() {
        let (near, far) = channel_pair();
        near.shutdown().await;
        let frame = far.read_frame().await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_interleave() {
        let (near, far) = channel_pair();

        // Many writers, distinct ids, recognizable payloads.
        let mut tasks = Vec::new();
        for n in 0..20u8 {
            let near = near.clone();
            tasks.push(tokio::spawn(async move {
                let id = ConnectionId::new();
                let payload = vec![n; 1000];
                for _ in 0..5 {
                    let mut buf = vec![0u8; FRAME_HEADER_SIZE + payload.len()];
                    buf[FRAME_HEADER_SIZE..].copy_from_slice(&payload);
                    near.write_frame(id, &mut buf, payload.len()).await.unwrap();
                }
                (id, n)
            }));
        }

        let reader = tokio::spawn(async move {
            let mut frames = Vec::new();
            for _ in 0..100 {
                frames.push(far.read_frame().await.unwrap().unwrap());
            }
            frames
        });

        let mut expected = std::collections::HashMap::new();
        for task in tasks {
            let (id, n) = task.await.unwrap();
            expected.insert(id, n);
        }
        // Every frame must decode intact: right size, uniform payload
        // matching its writer's byte.
        for frame in reader.await.unwrap() {
            let n = expected[&frame.connection_id];
            assert_eq!(frame.size(), 1000);
            assert!(frame.payload.iter().all(|&b| b == n));
        }
    }

    #[tokio::test]
    async fn test_preamble_then_frames() {
        let (near, mut far_raw) = tokio::io::duplex(64 * 1024);
        let near = RelayDataChannel::new(Box::new(near));

        near.write_preamble(&TunnelPreamble::new(5011)).await.unwrap();
        let id = ConnectionId::new();
        near.write_sentinel(id).await.unwrap();

        let preamble = TunnelPreamble::read_from(&mut far_raw).await.unwrap();
        assert_eq!(preamble.configuration_key, 5011);
        let frame = read_frame(&mut far_raw).await.unwrap().unwrap();
        assert!(frame.is_sentinel());
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let (near, _far) = channel_pair();
        let mut buf = vec![0u8; FRAME_HEADER_SIZE + MAX_FRAME_SIZE + 1];
        let result = near
            .write_frame(ConnectionId::new(), &mut buf, MAX_FRAME_SIZE + 1)
            .await;
        assert!(result.is_err());
    }
}
