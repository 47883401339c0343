#![warn(missing_docs)]

//! pipenet-core: foundational types shared by every layer.
//!
//! This crate provides the minimal set of core utilities:
//! - Configuration types
//! - Error handling and status codes
//! - Protocol constants
//! - Endpoints and the network interface contract
//! - Packet buffers and pooled datagram queues

/// Protocol constants shared across layers.
pub mod constants {
    /// Maximum transmission unit of one datagram for the UDP-style protocol.
    pub const DEFAULT_MTU: u16 = 1400;
    /// Fixed part of the UDP-style header: type, session token, flags.
    pub const UDP_BASE_HEADER_SIZE: usize = 4;
    /// Largest UDP-style header: base, connection token, pipeline id.
    pub const UDP_MAX_HEADER_SIZE: usize = UDP_BASE_HEADER_SIZE + 2 + 1;
    /// Upper bound of the reliable window, limited by the 32-bit ack mask.
    pub const MAX_RELIABLE_WINDOW_SIZE: u8 = 32;
    /// Size of the reliable-sequenced stage header.
    pub const RELIABLE_HEADER_SIZE: usize = 12;
    /// Size of the fragmentation stage header.
    pub const FRAGMENT_HEADER_SIZE: usize = 2;
    /// Size of the unreliable-sequenced stage header.
    pub const SEQUENCED_HEADER_SIZE: usize = 2;
    /// Largest number of pipelines a driver can hold, including the null pipeline.
    pub const MAX_PIPELINES: usize = 256;
}

/// Owned packet buffers with reserved header room.
pub mod buffer;
/// Configuration options for the driver and stages.
pub mod config;
/// Medium-agnostic endpoint identifiers.
pub mod endpoint;
/// Error types and results.
pub mod error;
/// Network interface abstraction for pluggable I/O.
pub mod interface;
/// Pooled datagram queues.
pub mod packet_pool;
/// Time sources.
pub mod time;

pub use buffer::PacketBuffer;
pub use config::Config;
pub use endpoint::Endpoint;
pub use error::{ErrorKind, Result, StatusCode};
pub use interface::NetworkInterface;
pub use packet_pool::{OutboundPacket, ReceiveQueue, SendHandle, SendQueue};
pub use time::{Clock, ManualClock, SystemClock};
