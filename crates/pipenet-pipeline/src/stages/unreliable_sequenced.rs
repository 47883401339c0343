use byteorder::{ByteOrder, NetworkEndian};
use pipenet_core::{constants::SEQUENCED_HEADER_SIZE, PacketBuffer, Result};
use pipenet_protocol::sequence_greater_than;
use tracing::trace;

use crate::stage::{PipelineStage, StageCapacity, StageConnection, StageContext, StageParameters, StageRequests};

/// Newest-wins delivery: packets older than the last delivered one are dropped.
/// Nothing is resent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnreliableSequencedStage;

impl UnreliableSequencedStage {
    /// Creates the stage.
    pub fn new() -> Self {
        Self
    }
}

impl PipelineStage for UnreliableSequencedStage {
    fn name(&self) -> &'static str {
        "unreliable-sequenced"
    }

    fn static_initialize(&mut self, _parameters: &StageParameters<'_>) -> Result<StageCapacity> {
        Ok(StageCapacity { header_capacity: SEQUENCED_HEADER_SIZE, payload_capacity: None })
    }

    fn initialize_connection(&self) -> Box<dyn StageConnection> {
        Box::new(SequencedConnection::default())
    }
}

#[derive(Debug, Default)]
struct SequencedConnection {
    send_sequence: u16,
    last_received: Option<u16>,
}

impl StageConnection for SequencedConnection {
    fn send(&mut self, _context: &StageContext, buffer: &mut PacketBuffer, _requests: &mut StageRequests) -> Result<()> {
        if buffer.is_empty() {
            return Ok(());
        }
        let mut header = [0u8; SEQUENCED_HEADER_SIZE];
        NetworkEndian::write_u16(&mut header, self.send_sequence);
        buffer.push_header(&header)?;
        self.send_sequence = self.send_sequence.wrapping_add(1);
        Ok(())
    }

    fn receive(&mut self, _context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        if buffer.is_empty() {
            return;
        }
        if buffer.len() < SEQUENCED_HEADER_SIZE {
            *requests |= StageRequests::ERROR;
            return;
        }
        let sequence = NetworkEndian::read_u16(buffer.as_slice());
        buffer.advance(SEQUENCED_HEADER_SIZE);

        match self.last_received {
            Some(last) if !sequence_greater_than(sequence, last) => {
                trace!(sequence, last, "dropping out-of-date sequenced packet");
                buffer.clear();
            }
            _ => self.last_received = Some(sequence),
        }
    }
}
