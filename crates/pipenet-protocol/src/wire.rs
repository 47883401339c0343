//! Connection framing: packet types, header flags and the default UDP-style protocol.
//!
//! A header is laid out as follows, multi-byte fields in network byte order:
//!
//! | field | size |
//! |---|---|
//! | packet type | 1 |
//! | session token | 2 |
//! | flags | 1 |
//! | connection token | 2, with [`HeaderFlags::HAS_CONNECT_TOKEN`] |
//! | pipeline id | 1, with [`HeaderFlags::HAS_PIPELINE`] |
//!
//! Everything after the header belongs to the pipeline.

use std::{fmt, time::Instant};

use bitflags::bitflags;
use pipenet_core::{
    constants::{UDP_BASE_HEADER_SIZE, UDP_MAX_HEADER_SIZE},
    Endpoint, ErrorKind, PacketBuffer, Result, StatusCode,
};
use tracing::warn;

use crate::stream::{DataStreamReader, DataStreamWriter};

/// Index of a pipeline registered with a driver. Zero is the null pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PipelineId(pub u8);

impl PipelineId {
    /// Pipeline without stages, always present.
    pub const NULL: PipelineId = PipelineId(0);

    /// Returns true for the null pipeline.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Position in the driver's pipeline list.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Id to identify a packet on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Client asks to connect.
    ConnectionRequest = 0,
    /// Server refuses a request.
    ConnectionReject = 1,
    /// Server accepts a request and hands out its token.
    ConnectionAccept = 2,
    /// Either side closes the connection.
    Disconnect = 3,
    /// Pipeline payload.
    Data = 4,
}

impl TryFrom<u8> for PacketType {
    type Error = ErrorKind;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::ConnectionRequest),
            1 => Ok(PacketType::ConnectionReject),
            2 => Ok(PacketType::ConnectionAccept),
            3 => Ok(PacketType::Disconnect),
            4 => Ok(PacketType::Data),
            _ => Err(StatusCode::HeaderInvalid.into()),
        }
    }
}

bitflags! {
    /// Optional header fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u8 {
        /// A connection token follows the flags byte.
        const HAS_CONNECT_TOKEN = 0b0000_0001;
        /// A pipeline id follows the tokens.
        const HAS_PIPELINE = 0b0000_0010;
    }
}

/// Everything the driver puts in front of an outbound datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Packet type.
    pub kind: PacketType,
    /// Session token the remote expects.
    pub session_token: u16,
    /// Our token, sent until the remote has proven it knows it.
    pub connection_token: Option<u16>,
    /// Pipeline carrying the payload, omitted for the null pipeline.
    pub pipeline: Option<PipelineId>,
}

impl PacketHeader {
    /// Header for a packet that carries only type and session token.
    pub fn control(kind: PacketType, session_token: u16) -> Self {
        Self { kind, session_token, connection_token: None, pipeline: None }
    }

    /// Header for a data packet.
    pub fn data(session_token: u16, connection_token: Option<u16>, pipeline: PipelineId) -> Self {
        Self {
            kind: PacketType::Data,
            session_token,
            connection_token,
            pipeline: (!pipeline.is_null()).then_some(pipeline),
        }
    }

    /// Flags implied by the optional fields.
    pub fn flags(&self) -> HeaderFlags {
        let mut flags = HeaderFlags::empty();
        flags.set(HeaderFlags::HAS_CONNECT_TOKEN, self.connection_token.is_some());
        flags.set(HeaderFlags::HAS_PIPELINE, self.pipeline.is_some());
        flags
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        UDP_BASE_HEADER_SIZE
            + if self.connection_token.is_some() { 2 } else { 0 }
            + if self.pipeline.is_some() { 1 } else { 0 }
    }
}

/// What the driver should do with a received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessPacketCommand<'a> {
    /// Malformed or irrelevant, ignore it.
    Drop,
    /// The remote owning `session_token` is now reachable at `new_endpoint`.
    AddressUpdate {
        /// New remote endpoint.
        new_endpoint: Endpoint,
        /// Session token of the moved connection.
        session_token: u16,
    },
    /// The medium confirmed our bind.
    BindAccept,
    /// Server accepted our request.
    ConnectionAccept {
        /// Echo of the token we sent in the request.
        session_token: u16,
        /// Token to put on everything we send from now on.
        connection_token: u16,
    },
    /// Server refused our request.
    ConnectionReject {
        /// Echo of the token we sent in the request.
        session_token: u16,
    },
    /// A client wants to connect.
    ConnectionRequest {
        /// Client's receive token.
        session_token: u16,
    },
    /// Pipeline payload for an established connection.
    Data {
        /// Our receive token.
        session_token: u16,
        /// Pipeline the payload belongs to.
        pipeline: PipelineId,
        /// Stage headers and payload.
        payload: &'a [u8],
    },
    /// The remote closed the connection.
    Disconnect {
        /// Our receive token.
        session_token: u16,
    },
    /// Data that also completes a pending handshake.
    DataWithImplicitConnectionAccept {
        /// Our receive token.
        session_token: u16,
        /// Remote's token.
        connection_token: u16,
        /// Pipeline the payload belongs to.
        pipeline: PipelineId,
        /// Stage headers and payload.
        payload: &'a [u8],
    },
}

/// Pluggable packet framing used by the driver.
///
/// A protocol turns inbound datagrams into [`ProcessPacketCommand`]s and writes
/// connection headers for outbound ones. Implementations are shared with
/// concurrent senders and must not need `&mut self` to write headers.
pub trait NetworkProtocol: Send + Sync + fmt::Debug {
    /// Largest header [`NetworkProtocol::write_header`] can produce.
    fn max_header_size(&self) -> usize;

    /// Returns true if [`NetworkProtocol::update`] should run this tick.
    fn needs_update(&self) -> bool {
        false
    }

    /// Periodic hook for protocols with their own timers.
    fn update(&mut self, _now: Instant) {}

    /// Decodes a received datagram. Malformed input yields [`ProcessPacketCommand::Drop`].
    fn process_receive<'a>(&self, endpoint: &Endpoint, datagram: &'a [u8]) -> ProcessPacketCommand<'a>;

    /// Prepends `header` to the contents of `buffer`.
    fn write_header(&self, buffer: &mut PacketBuffer, header: &PacketHeader) -> Result<()>;
}

/// The default UDP-style framing.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpProtocol;

impl UdpProtocol {
    /// Creates the protocol.
    pub fn new() -> Self {
        Self
    }
}

impl NetworkProtocol for UdpProtocol {
    fn max_header_size(&self) -> usize {
        UDP_MAX_HEADER_SIZE
    }

    fn process_receive<'a>(&self, endpoint: &Endpoint, datagram: &'a [u8]) -> ProcessPacketCommand<'a> {
        if datagram.len() < UDP_BASE_HEADER_SIZE {
            warn!(%endpoint, len = datagram.len(), "dropping datagram shorter than the header");
            return ProcessPacketCommand::Drop;
        }

        let mut reader = DataStreamReader::new(datagram);
        let kind = match PacketType::try_from(reader.read_byte()) {
            Ok(kind) => kind,
            Err(_) => {
                warn!(%endpoint, kind = datagram[0], "dropping datagram with unknown packet type");
                return ProcessPacketCommand::Drop;
            }
        };
        let session_token = reader.read_ushort_network_byte_order();
        let flags = match HeaderFlags::from_bits(reader.read_byte()) {
            Some(flags) => flags,
            None => {
                warn!(%endpoint, flags = datagram[3], "dropping datagram with unknown header flags");
                return ProcessPacketCommand::Drop;
            }
        };

        match kind {
            PacketType::ConnectionRequest | PacketType::ConnectionReject | PacketType::Disconnect => {
                if !flags.is_empty() || reader.remaining() != 0 {
                    warn!(%endpoint, ?kind, len = datagram.len(), "dropping malformed control packet");
                    return ProcessPacketCommand::Drop;
                }
                match kind {
                    PacketType::ConnectionRequest => ProcessPacketCommand::ConnectionRequest { session_token },
                    PacketType::ConnectionReject => ProcessPacketCommand::ConnectionReject { session_token },
                    _ => ProcessPacketCommand::Disconnect { session_token },
                }
            }
            PacketType::ConnectionAccept => {
                if flags != HeaderFlags::HAS_CONNECT_TOKEN || reader.remaining() != 2 {
                    warn!(%endpoint, len = datagram.len(), "dropping malformed connection accept");
                    return ProcessPacketCommand::Drop;
                }
                let connection_token = reader.read_ushort_network_byte_order();
                ProcessPacketCommand::ConnectionAccept { session_token, connection_token }
            }
            PacketType::Data => {
                let connection_token = if flags.contains(HeaderFlags::HAS_CONNECT_TOKEN) {
                    Some(reader.read_ushort_network_byte_order())
                } else {
                    None
                };
                let pipeline = if flags.contains(HeaderFlags::HAS_PIPELINE) {
                    PipelineId(reader.read_byte())
                } else {
                    PipelineId::NULL
                };
                if reader.has_failed_reads() {
                    warn!(%endpoint, len = datagram.len(), "dropping truncated data packet");
                    return ProcessPacketCommand::Drop;
                }
                let payload = &datagram[reader.bytes_read()..];
                match connection_token {
                    Some(connection_token) => ProcessPacketCommand::DataWithImplicitConnectionAccept {
                        session_token,
                        connection_token,
                        pipeline,
                        payload,
                    },
                    None => ProcessPacketCommand::Data { session_token, pipeline, payload },
                }
            }
        }
    }

    fn write_header(&self, buffer: &mut PacketBuffer, header: &PacketHeader) -> Result<()> {
        let mut writer = DataStreamWriter::new(UDP_MAX_HEADER_SIZE);
        writer.write_byte(header.kind as u8);
        writer.write_ushort_network_byte_order(header.session_token);
        writer.write_byte(header.flags().bits());
        if let Some(token) = header.connection_token {
            writer.write_ushort_network_byte_order(token);
        }
        if let Some(pipeline) = header.pipeline {
            writer.write_byte(pipeline.0);
        }
        if writer.has_failed_writes() {
            return Err(StatusCode::PacketOverflow.into());
        }
        buffer.push_header(writer.as_slice())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
        let mut buffer = PacketBuffer::with_capacity(64);
        buffer.reset(UDP_MAX_HEADER_SIZE);
        buffer.set(payload);
        UdpProtocol.write_header(&mut buffer, header).unwrap();
        buffer.as_slice().to_vec()
    }

    #[test]
    fn test_control_packet_layout() {
        let bytes = encode(&PacketHeader::control(PacketType::ConnectionRequest, 0xABCD), &[]);
        assert_eq!(bytes, vec![0, 0xAB, 0xCD, 0]);

        let command = UdpProtocol.process_receive(&Endpoint::ipc(1), &bytes);
        assert_eq!(command, ProcessPacketCommand::ConnectionRequest { session_token: 0xABCD });
    }

    #[test]
    fn test_accept_carries_connection_token() {
        let header = PacketHeader {
            kind: PacketType::ConnectionAccept,
            session_token: 7,
            connection_token: Some(0x0102),
            pipeline: None,
        };
        let bytes = encode(&header, &[]);
        assert_eq!(bytes, vec![2, 0, 7, 1, 0x01, 0x02]);
        assert_eq!(
            UdpProtocol.process_receive(&Endpoint::ipc(1), &bytes),
            ProcessPacketCommand::ConnectionAccept { session_token: 7, connection_token: 0x0102 }
        );
    }

    #[test]
    fn test_data_with_pipeline_and_token() {
        let header = PacketHeader::data(9, Some(0xBEEF), PipelineId(3));
        assert_eq!(header.size(), UDP_MAX_HEADER_SIZE);
        let bytes = encode(&header, b"hello");
        assert_eq!(&bytes[..7], &[4, 0, 9, 3, 0xBE, 0xEF, 3]);

        match UdpProtocol.process_receive(&Endpoint::ipc(1), &bytes) {
            ProcessPacketCommand::DataWithImplicitConnectionAccept {
                session_token,
                connection_token,
                pipeline,
                payload,
            } => {
                assert_eq!(session_token, 9);
                assert_eq!(connection_token, 0xBEEF);
                assert_eq!(pipeline, PipelineId(3));
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_null_pipeline_omits_pipeline_byte() {
        let header = PacketHeader::data(1, None, PipelineId::NULL);
        assert_eq!(header.flags(), HeaderFlags::empty());
        let bytes = encode(&header, &[5]);
        assert_eq!(bytes, vec![4, 0, 1, 0, 5]);
        assert_eq!(
            UdpProtocol.process_receive(&Endpoint::ipc(1), &bytes),
            ProcessPacketCommand::Data { session_token: 1, pipeline: PipelineId::NULL, payload: &[5] }
        );
    }

    #[test]
    fn test_malformed_datagrams_are_dropped() {
        let endpoint = Endpoint::ipc(1);
        // Too short.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[4, 0]), ProcessPacketCommand::Drop);
        // Unknown type.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[9, 0, 0, 0]), ProcessPacketCommand::Drop);
        // Unknown flag bits.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[4, 0, 0, 0x80]), ProcessPacketCommand::Drop);
        // Request with trailing bytes.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[0, 0, 1, 0, 7]), ProcessPacketCommand::Drop);
        // Accept without its token.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[2, 0, 1, 0]), ProcessPacketCommand::Drop);
        // Data claiming a pipeline byte that is missing.
        assert_eq!(UdpProtocol.process_receive(&endpoint, &[4, 0, 1, 2]), ProcessPacketCommand::Drop);
    }

    #[test]
    fn test_header_needs_headroom() {
        let mut buffer = PacketBuffer::with_capacity(16);
        buffer.reset(2);
        let result = UdpProtocol.write_header(&mut buffer, &PacketHeader::control(PacketType::Disconnect, 1));
        assert!(matches!(result, Err(ErrorKind::Status(StatusCode::PacketOverflow))));
    }
}
