//! Tunnel preamble
//!
//! Sent exactly once by the initiating side, immediately after a relay
//! stream is established and before any frame. It identifies which port
//! mapping the stream multiplexes for.

use crate::frame::CodecError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Preamble wire size: flags (2) + configuration key (4) + reserved (2)
pub const PREAMBLE_SIZE: usize = 8;

/// Fixed-size header identifying the target of a relay stream
///
/// Wire layout, all little-endian:
/// `[flags: u16][configuration_key: i32][reserved: u16]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelPreamble {
    /// Reserved flag bits, currently always zero
    pub flags: u16,
    /// Numeric key selecting the target port / mapping on the service side
    pub configuration_key: i32,
    /// Reserved length field, currently always zero
    pub reserved: u16,
}

impl TunnelPreamble {
    pub fn new(configuration_key: i32) -> Self {
        Self {
            flags: 0,
            configuration_key,
            reserved: 0,
        }
    }

    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let mut buf = [0u8; PREAMBLE_SIZE];
        buf[0..2].copy_from_slice(&self.flags.to_le_bytes());
        buf[2..6].copy_from_slice(&self.configuration_key.to_le_bytes());
        buf[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; PREAMBLE_SIZE]) -> Self {
        Self {
            flags: u16::from_le_bytes([buf[0], buf[1]]),
            configuration_key: i32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            reserved: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }

    /// Read a preamble from the front of a freshly-opened relay stream
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, CodecError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; PREAMBLE_SIZE];
        reader.read_exact(&mut buf).await?;
        Ok(Self::decode(&buf))
    }

    /// Write this preamble to a freshly-opened relay stream
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), CodecError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preamble_roundtrip() {
        let preamble = TunnelPreamble::new(5011);
        let decoded = TunnelPreamble::decode(&preamble.encode());
        assert_eq!(decoded, preamble);
        assert_eq!(decoded.configuration_key, 5011);
        assert_eq!(decoded.flags, 0);
        assert_eq!(decoded.reserved, 0);
    }

    #[test]
    fn test_preamble_wire_layout() {
        let preamble = TunnelPreamble {
            flags: 0x0102,
            configuration_key: 0x0403_0201,
            reserved: 0x0605,
        };
        // Little-endian field order on the wire
        assert_eq!(
            preamble.encode(),
            [0x02, 0x01, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]
        );
    }

    #[tokio::test]
    async fn test_preamble_stream_io() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let preamble = TunnelPreamble::new(-7);
        preamble.write_to(&mut tx).await.unwrap();
        let decoded = TunnelPreamble::read_from(&mut rx).await.unwrap();
        assert_eq!(decoded, preamble);
    }
}
