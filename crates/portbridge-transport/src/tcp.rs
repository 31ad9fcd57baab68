//! Plain-TCP relay transport
//!
//! A development/test stand-in for a cloud relay: the connector opens a TCP
//! connection and sends one authorization line, the listener verifies the
//! token and answers with a single status line before the stream is handed
//! to the engine. Transport security is out of scope here, exactly as it is
//! for the real relay (the underlying transport provides it).

use crate::{RelayConnector, RelayListener, RelayStream, TransportError};
use async_trait::async_trait;
use portbridge_proto::PROTOCOL_VERSION;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

const HANDSHAKE_OK: &str = "OK";
const HANDSHAKE_DENY: &str = "DENY";
const MAX_HANDSHAKE_LINE: usize = 1024;

/// Handshake line prefix carrying the protocol version; both sides must
/// agree on it before any stream data flows
fn handshake_prefix() -> String {
    format!("PORTBRIDGE/{}", PROTOCOL_VERSION)
}

/// Read one `\n`-terminated line without buffering past it
async fn read_line(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(TransportError::Handshake(
                "stream closed during handshake".to_string(),
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > MAX_HANDSHAKE_LINE {
            return Err(TransportError::Handshake("handshake line too long".to_string()));
        }
    }
    String::from_utf8(line).map_err(|_| TransportError::Handshake("non-UTF8 handshake".to_string()))
}

/// Dial-side TCP relay
pub struct TcpRelayConnector {
    relay_addr: String,
    token: String,
}

impl TcpRelayConnector {
    pub fn new(relay_addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            relay_addr: relay_addr.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl RelayConnector for TcpRelayConnector {
    async fn open(&self, entity_path: &str) -> Result<RelayStream, TransportError> {
        let mut stream = TcpStream::connect(&self.relay_addr).await?;
        stream.set_nodelay(true)?;

        let request = format!("{} {} {}\n", handshake_prefix(), self.token, entity_path);
        stream.write_all(request.as_bytes()).await?;

        let response = read_line(&mut stream).await?;
        if response != HANDSHAKE_OK {
            return Err(TransportError::AuthorizationRejected(response));
        }

        debug!(relay = %self.relay_addr, entity_path, "relay stream opened");
        Ok(Box::new(stream))
    }
}

/// Accept-side TCP relay listener
pub struct TcpRelayListener {
    listener: TcpListener,
    token: String,
    metadata: String,
}

impl TcpRelayListener {
    /// Bind the listener and fix its user metadata document
    pub async fn bind(
        addr: SocketAddr,
        token: impl Into<String>,
        metadata: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            token: token.into(),
            metadata: metadata.into(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the authorization exchange for one accepted connection
    async fn authorize(&self, stream: &mut TcpStream) -> Result<(), TransportError> {
        let line = read_line(stream).await?;
        let mut parts = line.split_whitespace();
        let prefix = parts.next().unwrap_or_default();
        let token = parts.next().unwrap_or_default();

        if prefix != handshake_prefix() {
            return Err(TransportError::Handshake(format!(
                "unexpected handshake prefix '{}'",
                prefix
            )));
        }
        if token != self.token {
            stream
                .write_all(format!("{}\n", HANDSHAKE_DENY).as_bytes())
                .await?;
            return Err(TransportError::AuthorizationRejected(
                "token mismatch".to_string(),
            ));
        }

        stream
            .write_all(format!("{}\n", HANDSHAKE_OK).as_bytes())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RelayListener for TcpRelayListener {
    fn metadata(&self) -> &str {
        &self.metadata
    }

    async fn accept(&self) -> Result<RelayStream, TransportError> {
        // A failed handshake drops that one connection, never the listener.
        loop {
            let (mut stream, peer) = self.listener.accept().await?;
            stream.set_nodelay(true)?;
            match self.authorize(&mut stream).await {
                Ok(()) => {
                    debug!(%peer, "relay stream accepted");
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    warn!(%peer, error = %e, "rejected relay connection");
                }
            }
        }
    }
}
