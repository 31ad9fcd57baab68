//! Portbridge tunneling engine
//!
//! The multiplexing core: data channels on both ends of a tunnel, the
//! per-connection frame queue, the frame dispatcher, the uplink/downlink
//! pumps, the relay tunnel lifecycle, and the rotating tunnel pool.
//!
//! One relay stream carries many logical TCP connections as frames tagged
//! with a [`ConnectionId`](portbridge_proto::ConnectionId). Per-connection
//! delivery is strictly FIFO; different connections interleave arbitrarily
//! on the stream.

pub mod dispatcher;
pub mod error;
pub mod frame_queue;
pub mod local_channel;
pub mod metrics;
pub mod pool;
pub mod pump;
pub mod relay_channel;
pub mod tunnel;

pub use dispatcher::{CorrelationCallback, FrameDispatcher};
pub use error::EngineError;
pub use frame_queue::{CompletionCallback, FrameQueue, FrameSink};
pub use local_channel::{LocalChannelFactory, LocalDataChannel, TcpChannelFactory};
pub use metrics::{ChannelMetrics, MetricsSnapshot};
pub use pool::{TunnelFactory, TunnelPool};
pub use pump::{DownlinkPump, UplinkPump};
pub use relay_channel::RelayDataChannel;
pub use tunnel::RelayTunnel;
