use pipenet_core::{constants::RELIABLE_HEADER_SIZE, ErrorKind, PacketBuffer, Result};
use tracing::{trace, warn};

use crate::{
    reliability::{ReceiveClass, ReliableContext, ReliableHeader, ReliableParameters, ReliablePacketType, ACK_PAYLOAD},
    stage::{PipelineStage, StageCapacity, StageConnection, StageContext, StageParameters, StageRequests},
    statistics::StageStatistics,
};

/// Guarantees in-order, exactly-once delivery with resends and acks.
///
/// Sending fails with [`ErrorKind::OutgoingQueueIsFull`] while the window of
/// unacknowledged packets is full.
#[derive(Debug, Clone, Default)]
pub struct ReliableSequencedStage {
    window_size: Option<u8>,
    parameters: ReliableParameters,
}

impl ReliableSequencedStage {
    /// Creates a stage using the driver's reliable settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the configured window size (1-32).
    pub fn with_window_size(mut self, window_size: u8) -> Self {
        self.window_size = Some(window_size);
        self
    }
}

impl PipelineStage for ReliableSequencedStage {
    fn name(&self) -> &'static str {
        "reliable-sequenced"
    }

    fn static_initialize(&mut self, parameters: &StageParameters<'_>) -> Result<StageCapacity> {
        let mut reliable = ReliableParameters::from_config(parameters.config);
        if let Some(window_size) = self.window_size {
            reliable.window_size = window_size;
        }
        reliable.validate()?;
        if parameters.max_packet_payload <= RELIABLE_HEADER_SIZE {
            return Err(ErrorKind::InvalidConfiguration("stage headers exceed the message size"));
        }
        self.parameters = reliable;
        Ok(StageCapacity { header_capacity: RELIABLE_HEADER_SIZE, payload_capacity: None })
    }

    fn initialize_connection(&self) -> Box<dyn StageConnection> {
        Box::new(ReliableConnection { context: ReliableContext::new(self.parameters) })
    }
}

#[derive(Debug)]
struct ReliableConnection {
    context: ReliableContext,
}

impl StageConnection for ReliableConnection {
    fn send(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) -> Result<()> {
        let now = context.now;
        if !buffer.is_empty() {
            let header = self.context.send(buffer.as_slice(), now)?;
            buffer.push_header(&header.encode())?;
        } else if let Some(sequence) = self.context.next_resend(now) {
            if let Some(header) = self.context.resend(sequence, now) {
                trace!(sequence, pipeline = context.pipeline.0, "resending reliable packet");
                buffer.set(self.context.payload(sequence).unwrap_or_default());
                buffer.push_header(&header.encode())?;
            }
            if self.context.next_resend(now).is_some() {
                *requests |= StageRequests::RESUME;
            }
        } else if self.context.ack_pending() {
            let header = self.context.ack_header(now);
            trace!(ack = header.ack_sequence, pipeline = context.pipeline.0, "sending reliable ack");
            buffer.set(&ACK_PAYLOAD);
            buffer.push_header(&header.encode())?;
        }

        if self.context.has_unacked() || self.context.ack_pending() {
            *requests |= StageRequests::UPDATE;
        }
        Ok(())
    }

    fn receive(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) {
        let now = context.now;
        if buffer.is_empty() {
            if let Some(payload) = self.context.take_buffered_in_order() {
                buffer.set(&payload);
                if self.context.has_buffered_in_order() {
                    *requests |= StageRequests::RESUME;
                }
            }
            return;
        }

        let Some(header) = ReliableHeader::decode(buffer.as_slice()) else {
            warn!(len = buffer.len(), pipeline = context.pipeline.0, "dropping malformed reliable packet");
            *requests |= StageRequests::ERROR;
            return;
        };
        buffer.advance(RELIABLE_HEADER_SIZE);
        self.context.process_ack(&header, now);

        if header.packet_type == ReliablePacketType::Ack {
            buffer.clear();
            return;
        }

        *requests |= StageRequests::SEND_UPDATE;
        match self.context.classify(header.sequence) {
            ReceiveClass::InOrder => {
                self.context.accept_in_order(header.sequence, now);
                if self.context.has_buffered_in_order() {
                    *requests |= StageRequests::RESUME;
                }
            }
            ReceiveClass::OutOfOrder => {
                self.context.accept_out_of_order(header.sequence, buffer.as_slice(), now);
                buffer.clear();
            }
            class => {
                trace!(sequence = header.sequence, ?class, "dropping reliable packet");
                buffer.clear();
            }
        }
    }

    fn send_room(&self) -> Option<usize> {
        Some(self.context.send_room())
    }

    fn statistics(&self) -> Option<StageStatistics> {
        Some(StageStatistics::Reliable(self.context.statistics()))
    }
}
