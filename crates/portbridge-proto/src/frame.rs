//! Frame codec
//!
//! Every unit of tunneled data travels as a frame:
//!
//! ```text
//! [connection id: 16 bytes][size: u16 LE][payload: size bytes]
//! ```
//!
//! A frame with `size == 0` is the close sentinel: it carries no payload
//! and tells the receiving side that the producer's local socket reached
//! end-of-stream, so the receiver must tear down its matching endpoint.

use crate::connection_id::{ConnectionId, CONNECTION_ID_SIZE};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Frame header size: connection id (16) + payload size (2) = 18 bytes
pub const FRAME_HEADER_SIZE: usize = CONNECTION_ID_SIZE + 2;

/// Maximum payload size of a single frame (one u16 length field's worth).
/// Bounds per-frame allocation against a malicious or corrupted size field.
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Frame codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload too large for one frame: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("stream ended mid-header after {0} bytes")]
    TruncatedHeader(usize),

    #[error("stream ended mid-payload, expected {expected} bytes: {source}")]
    TruncatedPayload {
        expected: usize,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One framed unit of payload data tagged with a connection identifier
#[derive(Debug, Clone)]
pub struct Frame {
    pub connection_id: ConnectionId,
    pub payload: Bytes,
}

impl Frame {
    /// Construct a data frame, rejecting payloads that exceed one frame
    pub fn new(connection_id: ConnectionId, payload: Bytes) -> Result<Self, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        Ok(Self {
            connection_id,
            payload,
        })
    }

    /// Construct the zero-size close sentinel for a connection
    pub fn sentinel(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            payload: Bytes::new(),
        }
    }

    /// Payload size in bytes (0 for the sentinel)
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    /// Whether this frame is the close sentinel
    pub fn is_sentinel(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode header + payload into one contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(self.connection_id.as_bytes());
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Stamp a frame header into the first [`FRAME_HEADER_SIZE`] bytes of `buf`.
///
/// Callers that read payload bytes directly into a reusable buffer reserve
/// header space at the front, then stamp the header just before issuing a
/// single write of header + payload.
pub fn stamp_frame_header(buf: &mut [u8], connection_id: ConnectionId, size: u16) {
    buf[..CONNECTION_ID_SIZE].copy_from_slice(connection_id.as_bytes());
    buf[CONNECTION_ID_SIZE..FRAME_HEADER_SIZE].copy_from_slice(&size.to_le_bytes());
}

/// Read one frame from an async byte stream.
///
/// Returns `Ok(None)` when the stream is cleanly closed, i.e. zero bytes
/// were available at the first header byte. A stream that ends partway
/// through a header or payload is a codec error, not a clean close. The
/// header read loops because a single read may return fewer bytes than
/// requested.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::TruncatedHeader(filled));
        }
        filled += n;
    }

    let mut id_bytes = [0u8; CONNECTION_ID_SIZE];
    id_bytes.copy_from_slice(&header[..CONNECTION_ID_SIZE]);
    let connection_id = ConnectionId::from_bytes(id_bytes);
    let size = u16::from_le_bytes([header[CONNECTION_ID_SIZE], header[CONNECTION_ID_SIZE + 1]]) as usize;

    if size == 0 {
        return Ok(Some(Frame::sentinel(connection_id)));
    }

    let mut payload = vec![0u8; size];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|source| CodecError::TruncatedPayload {
            expected: size,
            source,
        })?;

    Ok(Some(Frame {
        connection_id,
        payload: payload.into(),
    }))
}
