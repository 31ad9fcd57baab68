//! Engine errors

use thiserror::Error;

/// Errors surfaced by the tunneling engine
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] portbridge_proto::CodecError),

    #[error("transport error: {0}")]
    Transport(#[from] portbridge_transport::TransportError),

    #[error("tunnel is closed")]
    TunnelClosed,

    #[error("data channel is closed")]
    ChannelClosed,
}
