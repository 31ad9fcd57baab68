//! Connection identifiers
//!
//! A [`ConnectionId`] correlates every frame belonging to one logical TCP
//! connection multiplexed over a relay stream. It is created once, on the
//! side that accepts the local connection, and carried in every frame
//! until the connection closes. Identifiers are never reused.

use std::fmt;
use uuid::Uuid;

/// Serialized width of a connection identifier in bytes
pub const CONNECTION_ID_SIZE: usize = 16;

/// Opaque 16-byte identifier for one logical tunneled connection
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; CONNECTION_ID_SIZE]);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// Reconstruct an identifier from its wire representation
    pub fn from_bytes(bytes: [u8; CONNECTION_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Fixed-width wire representation
    pub fn as_bytes(&self) -> &[u8; CONNECTION_ID_SIZE] {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}
