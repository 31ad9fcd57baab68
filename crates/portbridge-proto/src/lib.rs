//! Portbridge Protocol Definitions
//!
//! This crate defines the wire-level types for the portbridge tunneling
//! system: connection identifiers, the frame and preamble codecs, firewall
//! rules for local listener admission, and the relay listener metadata
//! document.

pub mod connection_id;
pub mod firewall;
pub mod frame;
pub mod metadata;
pub mod preamble;

pub use connection_id::{ConnectionId, CONNECTION_ID_SIZE};
pub use firewall::{FirewallError, FirewallRules, IpRange};
pub use frame::{read_frame, stamp_frame_header, CodecError, Frame, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
pub use metadata::{EndpointMetadata, MetadataError, PortSet};
pub use preamble::{TunnelPreamble, PREAMBLE_SIZE};

/// Protocol version
pub const PROTOCOL_VERSION: u16 = 1;
