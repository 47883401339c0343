#![warn(missing_docs)]

//! pipenet-protocol: bit streams, sequence arithmetic and connection framing.

/// Packed integer compression model.
pub mod compression;
/// Round-trip time estimation.
pub mod rtt;
/// Sequence buffers for tracking sent/received packets.
pub mod sequence_buffer;
/// Bit- and byte-level stream writer and reader.
pub mod stream;
/// Packet types, header flags and the UDP-style protocol.
pub mod wire;

pub use compression::{NetworkCompressionModel, DEFAULT_COMPRESSION_MODEL};
pub use rtt::RttEstimator;
pub use sequence_buffer::{sequence_greater_than, sequence_less_than, SequenceBuffer, SequenceNumber};
pub use stream::{DataStreamReader, DataStreamWriter, FixedStringCapacity};
pub use wire::{
    HeaderFlags, NetworkProtocol, PacketHeader, PacketType, PipelineId, ProcessPacketCommand, UdpProtocol,
};
