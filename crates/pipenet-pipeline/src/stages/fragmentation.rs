//! Splits payloads larger than one datagram and reassembles them.
//!
//! Each fragment carries a two-byte header in network byte order:
//!
//! ```text
//!  15    14    13 ............ 0
//! First Last   fragment sequence
//! ```
//!
//! The sequence increases by one per fragment and wraps at 14 bits.
//! Reassembly is all-or-nothing: a gap discards the partial message and
//! nothing is delivered until the next fragment flagged First.

use byteorder::{ByteOrder, NetworkEndian};
use pipenet_core::{constants::FRAGMENT_HEADER_SIZE, ErrorKind, PacketBuffer, Result};
use tracing::{trace, warn};

use crate::stage::{PipelineStage, StageCapacity, StageConnection, StageContext, StageParameters, StageRequests};

const FIRST_FLAG: u16 = 0x8000;
const LAST_FLAG: u16 = 0x4000;
const SEQUENCE_MASK: u16 = 0x3FFF;

/// Decoded fragment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// First fragment of a message.
    pub first: bool,
    /// Last fragment of a message.
    pub last: bool,
    /// 14-bit fragment sequence.
    pub sequence: u16,
}

impl FragmentHeader {
    /// Encodes the header.
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut value = self.sequence & SEQUENCE_MASK;
        if self.first {
            value |= FIRST_FLAG;
        }
        if self.last {
            value |= LAST_FLAG;
        }
        let mut bytes = [0u8; FRAGMENT_HEADER_SIZE];
        NetworkEndian::write_u16(&mut bytes, value);
        bytes
    }

    /// Decodes a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAGMENT_HEADER_SIZE {
            return None;
        }
        let value = NetworkEndian::read_u16(bytes);
        Some(Self { first: value & FIRST_FLAG != 0, last: value & LAST_FLAG != 0, sequence: value & SEQUENCE_MASK })
    }
}

/// Fragmentation stage.
#[derive(Debug, Clone, Default)]
pub struct FragmentationStage {
    payload_capacity: Option<usize>,
    resolved_payload_capacity: usize,
    fragment_size: usize,
}

impl FragmentationStage {
    /// Creates a stage accepting messages up to the configured fragment payload capacity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the largest message accepted.
    pub fn with_payload_capacity(mut self, capacity: usize) -> Self {
        self.payload_capacity = Some(capacity);
        self
    }

    /// Content bytes per fragment, known once the pipeline is built.
    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }
}

impl PipelineStage for FragmentationStage {
    fn name(&self) -> &'static str {
        "fragmentation"
    }

    fn static_initialize(&mut self, parameters: &StageParameters<'_>) -> Result<StageCapacity> {
        if parameters.max_packet_payload <= FRAGMENT_HEADER_SIZE {
            return Err(ErrorKind::InvalidConfiguration("stage headers exceed the message size"));
        }
        self.fragment_size = parameters.max_packet_payload - FRAGMENT_HEADER_SIZE;
        self.resolved_payload_capacity =
            self.payload_capacity.unwrap_or(parameters.config.fragment_payload_capacity);
        Ok(StageCapacity {
            header_capacity: FRAGMENT_HEADER_SIZE,
            payload_capacity: Some(self.resolved_payload_capacity),
        })
    }

    fn initialize_connection(&self) -> Box<dyn StageConnection> {
        Box::new(FragmentationConnection {
            fragment_size: self.fragment_size.max(1),
            payload_capacity: self.resolved_payload_capacity,
            send_sequence: 0,
            outgoing: Vec::with_capacity(self.resolved_payload_capacity),
            outgoing_offset: 0,
            incoming: Vec::with_capacity(self.resolved_payload_capacity),
            expected_sequence: None,
        })
    }
}

#[derive(Debug)]
struct FragmentationConnection {
    fragment_size: usize,
    payload_capacity: usize,
    send_sequence: u16,
    outgoing: Vec<u8>,
    outgoing_offset: usize,
    incoming: Vec<u8>,
    /// Sequence of the next fragment while a message is being reassembled.
    expected_sequence: Option<u16>,
}

impl FragmentationConnection {
    fn next_send_sequence(&mut self) -> u16 {
        let sequence = self.send_sequence;
        self.send_sequence = (sequence + 1) & SEQUENCE_MASK;
        sequence
    }

    /// Emits the next chunk of `outgoing`.
    fn emit_chunk(&mut self, buffer: &mut PacketBuffer, requests: &mut StageRequests) -> Result<()> {
        let start = self.outgoing_offset;
        let end = (start + self.fragment_size).min(self.outgoing.len());
        let header = FragmentHeader { first: start == 0, last: end == self.outgoing.len(), sequence: self.next_send_sequence() };

        buffer.set(&self.outgoing[start..end]);
        buffer.push_header(&header.encode())?;

        if header.last {
            self.outgoing.clear();
            self.outgoing_offset = 0;
        } else {
            self.outgoing_offset = end;
            *requests |= StageRequests::RESUME;
        }
        Ok(())
    }

    fn reset_reassembly(&mut self) {
        self.incoming.clear();
        self.expected_sequence = None;
    }
}

impl StageConnection for FragmentationConnection {
    fn send(&mut self, _context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) -> Result<()> {
        if buffer.is_empty() {
            if self.outgoing.is_empty() {
                return Ok(());
            }
            return self.emit_chunk(buffer, requests);
        }

        if buffer.len() <= self.fragment_size {
            let header = FragmentHeader { first: true, last: true, sequence: self.next_send_sequence() };
            buffer.push_header(&header.encode())?;
            return Ok(());
        }

        self.outgoing.clear();
        self.outgoing.extend_from_slice(buffer.as_slice());
        self.outgoing_offset = 0;
        self.emit_chunk(buffer, requests)
    }

    fn packets_for(&self, len: usize) -> usize {
        len.div_ceil(self.fragment_size).max(1)
    }

    fn receive(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        if buffer.is_empty() {
            return;
        }
        let Some(header) = FragmentHeader::decode(buffer.as_slice()) else {
            warn!(len = buffer.len(), pipeline = context.pipeline.0, "dropping truncated fragment");
            *requests |= StageRequests::ERROR;
            return;
        };
        buffer.advance(FRAGMENT_HEADER_SIZE);

        if header.first {
            if self.expected_sequence.is_some() {
                trace!(sequence = header.sequence, "new message started before the last one completed");
            }
            self.reset_reassembly();
            if header.last {
                return;
            }
        } else if self.expected_sequence != Some(header.sequence) {
            if self.expected_sequence.is_some() {
                trace!(sequence = header.sequence, expected = ?self.expected_sequence, "fragment gap, discarding message");
            }
            self.reset_reassembly();
            buffer.clear();
            return;
        }

        if self.incoming.len() + buffer.len() > self.payload_capacity {
            warn!(
                len = self.incoming.len() + buffer.len(),
                capacity = self.payload_capacity,
                "reassembled message exceeds the payload capacity"
            );
            self.reset_reassembly();
            buffer.clear();
            return;
        }

        self.incoming.extend_from_slice(buffer.as_slice());
        if header.last {
            buffer.set(&self.incoming);
            self.reset_reassembly();
        } else {
            self.expected_sequence = Some((header.sequence + 1) & SEQUENCE_MASK);
            buffer.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bits() {
        let header = FragmentHeader { first: true, last: false, sequence: 0x3FFF };
        assert_eq!(header.encode(), [0xBF, 0xFF]);
        assert_eq!(FragmentHeader::decode(&header.encode()), Some(header));

        let header = FragmentHeader { first: false, last: true, sequence: 5 };
        assert_eq!(header.encode(), [0x40, 0x05]);
        assert_eq!(FragmentHeader::decode(&[0x40]), None);
    }
}
