//! Sliding-window acknowledgement and resend logic.
//!
//! Each side keeps two independent halves:
//!
//! - the send half numbers outgoing payloads, keeps a copy of each until the
//!   remote acknowledges it, and resends copies whose timeout expired.
//! - the receive half tracks the newest sequence seen plus a 32-bit mask of
//!   the ones before it, delivers payloads strictly in order and buffers
//!   early arrivals until the gap closes.
//!
//! Every header carries the receive half's state, so acknowledgements ride
//! on regular traffic. Bit `n` of the ack mask stands for `ack_sequence - n`.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, NetworkEndian};
use pipenet_core::{
    constants::{MAX_RELIABLE_WINDOW_SIZE, RELIABLE_HEADER_SIZE},
    Config, ErrorKind, Result,
};
use pipenet_protocol::{sequence_buffer::sequence_distance, sequence_less_than, RttEstimator, SequenceBuffer};

use crate::statistics::ReliableStatistics;

/// Payload of a dedicated acknowledgement packet.
pub const ACK_PAYLOAD: [u8; 1] = [0];

/// Kind of a reliable packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReliablePacketType {
    /// Carries application data.
    Payload = 0,
    /// Carries only acknowledgement state.
    Ack = 1,
}

/// Header prepended by the reliable stage, all fields in network byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    /// Payload or ack.
    pub packet_type: ReliablePacketType,
    /// Milliseconds between receiving `ack_sequence` and writing this header.
    pub processing_time: u16,
    /// Sequence of this packet. Meaningless for acks.
    pub sequence: u16,
    /// Newest sequence received from the remote.
    pub ack_sequence: u16,
    /// Received flags for `ack_sequence` and the 31 sequences before it.
    pub ack_mask: u32,
}

impl ReliableHeader {
    /// Encodes the header.
    pub fn encode(&self) -> [u8; RELIABLE_HEADER_SIZE] {
        let mut bytes = [0u8; RELIABLE_HEADER_SIZE];
        NetworkEndian::write_u16(&mut bytes[0..2], self.packet_type as u16);
        NetworkEndian::write_u16(&mut bytes[2..4], self.processing_time);
        NetworkEndian::write_u16(&mut bytes[4..6], self.sequence);
        NetworkEndian::write_u16(&mut bytes[6..8], self.ack_sequence);
        NetworkEndian::write_u32(&mut bytes[8..12], self.ack_mask);
        bytes
    }

    /// Decodes a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RELIABLE_HEADER_SIZE {
            return None;
        }
        let packet_type = match NetworkEndian::read_u16(&bytes[0..2]) {
            0 => ReliablePacketType::Payload,
            1 => ReliablePacketType::Ack,
            _ => return None,
        };
        Some(Self {
            packet_type,
            processing_time: NetworkEndian::read_u16(&bytes[2..4]),
            sequence: NetworkEndian::read_u16(&bytes[4..6]),
            ack_sequence: NetworkEndian::read_u16(&bytes[6..8]),
            ack_mask: NetworkEndian::read_u32(&bytes[8..12]),
        })
    }
}

/// Window and timer bounds of one reliable stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableParameters {
    /// Packets in flight (1-32).
    pub window_size: u8,
    /// Lower bound of the resend timeout.
    pub minimum_resend_time: Duration,
    /// Upper bound of the resend timeout.
    pub maximum_resend_time: Duration,
}

impl ReliableParameters {
    /// Takes the reliable settings from a driver configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            window_size: config.reliable_window_size,
            minimum_resend_time: config.reliable_minimum_resend_time,
            maximum_resend_time: config.reliable_maximum_resend_time,
        }
    }

    /// Checks the window bounds.
    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 || self.window_size > MAX_RELIABLE_WINDOW_SIZE {
            return Err(ErrorKind::InvalidConfiguration("reliable_window_size must be within 1..=32"));
        }
        if self.minimum_resend_time > self.maximum_resend_time {
            return Err(ErrorKind::InvalidConfiguration("minimum resend time exceeds maximum resend time"));
        }
        Ok(())
    }
}

impl Default for ReliableParameters {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// How an arriving payload relates to the receive window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveClass {
    /// Outside the window, dropped.
    Stale,
    /// Already received, dropped.
    Duplicate,
    /// The next expected sequence, delivered now.
    InOrder,
    /// Ahead of a gap, buffered.
    OutOfOrder,
}

#[derive(Debug)]
struct SentPacket {
    payload: Vec<u8>,
    sent_at: Instant,
    resend_count: u32,
}

/// Reliability state of one connection.
#[derive(Debug)]
pub struct ReliableContext {
    parameters: ReliableParameters,

    next_sequence: u16,
    sent: SequenceBuffer<SentPacket>,
    remote_ack_sequence: u16,
    remote_ack_mask: u32,

    expected_sequence: u16,
    received_sequence: u16,
    received_mask: u32,
    received_at: Option<Instant>,
    out_of_order: SequenceBuffer<Vec<u8>>,
    ack_pending: bool,

    rtt: RttEstimator,
    statistics: ReliableStatistics,
}

impl ReliableContext {
    /// Creates an empty context. No sequence has been sent or received.
    pub fn new(parameters: ReliableParameters) -> Self {
        let window = parameters.window_size.clamp(1, MAX_RELIABLE_WINDOW_SIZE) as u16;
        Self {
            parameters,
            next_sequence: 0,
            sent: SequenceBuffer::with_capacity(window),
            remote_ack_sequence: u16::MAX,
            remote_ack_mask: 0,
            expected_sequence: 0,
            received_sequence: u16::MAX,
            received_mask: 0,
            received_at: None,
            out_of_order: SequenceBuffer::with_capacity(window),
            ack_pending: false,
            rtt: RttEstimator::new(),
            statistics: ReliableStatistics::default(),
        }
    }

    fn window(&self) -> u16 {
        self.parameters.window_size.clamp(1, MAX_RELIABLE_WINDOW_SIZE) as u16
    }

    /// Current resend timeout.
    pub fn resend_timeout(&self) -> Duration {
        self.rtt.resend_timeout(self.parameters.minimum_resend_time, self.parameters.maximum_resend_time)
    }

    /// Returns true when no more packets may be sent until an ack arrives.
    pub fn is_window_full(&self) -> bool {
        self.sent.exists(self.next_sequence.wrapping_sub(self.window()))
    }

    /// Packets that can be sent back to back before the window is full.
    pub fn send_room(&self) -> usize {
        let oldest = self.next_sequence.wrapping_sub(self.window());
        (0..self.window()).take_while(|&offset| !self.sent.exists(oldest.wrapping_add(offset))).count()
    }

    /// Returns true while any sent packet is unacknowledged.
    pub fn has_unacked(&self) -> bool {
        !self.sent.is_empty()
    }

    /// Returns true if the receive state changed since the last header was written.
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Sequence the next payload will get.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Newest sequence the remote acknowledged.
    pub fn remote_ack_sequence(&self) -> u16 {
        self.remote_ack_sequence
    }

    /// Stores `payload` for resending and returns its header.
    pub fn send(&mut self, payload: &[u8], now: Instant) -> Result<ReliableHeader> {
        if self.is_window_full() {
            return Err(ErrorKind::OutgoingQueueIsFull);
        }
        let sequence = self.next_sequence;
        self.sent.insert(sequence, SentPacket { payload: payload.to_vec(), sent_at: now, resend_count: 0 });
        self.next_sequence = sequence.wrapping_add(1);
        self.statistics.packets_sent += 1;
        Ok(self.header(ReliablePacketType::Payload, sequence, now))
    }

    /// Header of a dedicated acknowledgement.
    pub fn ack_header(&mut self, now: Instant) -> ReliableHeader {
        self.statistics.acks_sent += 1;
        self.header(ReliablePacketType::Ack, self.next_sequence.wrapping_sub(1), now)
    }

    /// Writes the current receive state into a header.
    fn header(&mut self, packet_type: ReliablePacketType, sequence: u16, now: Instant) -> ReliableHeader {
        let processing_time = self
            .received_at
            .map(|at| now.saturating_duration_since(at).as_millis().min(u16::MAX as u128) as u16)
            .unwrap_or(0);
        self.ack_pending = false;
        ReliableHeader {
            packet_type,
            processing_time,
            sequence,
            ack_sequence: self.received_sequence,
            ack_mask: self.received_mask,
        }
    }

    /// Oldest unacknowledged sequence whose resend timeout expired.
    pub fn next_resend(&self, now: Instant) -> Option<u16> {
        let timeout = self.resend_timeout();
        (1..=self.window()).rev().map(|back| self.next_sequence.wrapping_sub(back)).find(|&sequence| {
            self.sent.get(sequence).is_some_and(|packet| now.saturating_duration_since(packet.sent_at) >= timeout)
        })
    }

    /// Marks `sequence` as resent and returns a fresh header for it.
    pub fn resend(&mut self, sequence: u16, now: Instant) -> Option<ReliableHeader> {
        let packet = self.sent.get_mut(sequence)?;
        packet.sent_at = now;
        packet.resend_count += 1;
        self.statistics.packets_resent += 1;
        Some(self.header(ReliablePacketType::Payload, sequence, now))
    }

    /// Stored payload of an unacknowledged sequence.
    pub fn payload(&self, sequence: u16) -> Option<&[u8]> {
        self.sent.get(sequence).map(|packet| packet.payload.as_slice())
    }

    /// Applies the acknowledgement state of a received header.
    ///
    /// Releases every acknowledged packet and samples the round trip of
    /// `ack_sequence` unless it was resent.
    pub fn process_ack(&mut self, header: &ReliableHeader, now: Instant) {
        if header.ack_mask == 0 {
            return;
        }

        if let Some(packet) = self.sent.get(header.ack_sequence) {
            if packet.resend_count == 0 {
                let sample = now.saturating_duration_since(packet.sent_at);
                self.rtt.update(sample, Duration::from_millis(header.processing_time as u64));
            }
        }

        for bit in 0..32u16 {
            if header.ack_mask & (1 << bit) != 0 {
                self.sent.remove(header.ack_sequence.wrapping_sub(bit));
            }
        }

        if self.remote_ack_mask == 0 || sequence_less_than(self.remote_ack_sequence, header.ack_sequence) {
            self.remote_ack_sequence = header.ack_sequence;
            self.remote_ack_mask = header.ack_mask;
        }
    }

    /// Classifies an arriving payload sequence and counts it.
    pub fn classify(&mut self, sequence: u16) -> ReceiveClass {
        self.statistics.packets_received += 1;
        let window = self.window();

        let class = if sequence_less_than(sequence, self.expected_sequence) {
            if sequence_distance(sequence, self.expected_sequence) > window {
                ReceiveClass::Stale
            } else {
                ReceiveClass::Duplicate
            }
        } else {
            match sequence_distance(self.expected_sequence, sequence) {
                0 => ReceiveClass::InOrder,
                ahead if ahead >= window => ReceiveClass::Stale,
                _ if self.out_of_order.exists(sequence) => ReceiveClass::Duplicate,
                _ => ReceiveClass::OutOfOrder,
            }
        };

        match class {
            ReceiveClass::Stale => self.statistics.packets_stale += 1,
            ReceiveClass::Duplicate => {
                self.statistics.packets_duplicated += 1;
                // The remote is repeating itself, so our last ack got lost.
                self.ack_pending = true;
            }
            ReceiveClass::OutOfOrder => self.statistics.packets_out_of_order += 1,
            ReceiveClass::InOrder => {}
        }
        class
    }

    /// Records a fresh sequence in the ack state.
    fn record_received(&mut self, sequence: u16, now: Instant) {
        if self.received_mask == 0 || sequence_less_than(self.received_sequence, sequence) {
            let shift = sequence_distance(self.received_sequence, sequence) as u32;
            self.received_mask = if self.received_mask == 0 || shift >= 32 {
                0
            } else {
                self.received_mask << shift
            };
            self.received_mask |= 1;
            self.received_sequence = sequence;
            self.received_at = Some(now);
        } else {
            let back = sequence_distance(sequence, self.received_sequence) as u32;
            if back < 32 {
                self.received_mask |= 1 << back;
            }
        }
        self.ack_pending = true;
    }

    /// Accepts the expected sequence. Its payload is delivered by the caller.
    pub fn accept_in_order(&mut self, sequence: u16, now: Instant) {
        self.record_received(sequence, now);
        self.expected_sequence = self.expected_sequence.wrapping_add(1);
    }

    /// Buffers a payload that arrived ahead of a gap.
    pub fn accept_out_of_order(&mut self, sequence: u16, payload: &[u8], now: Instant) {
        self.record_received(sequence, now);
        self.out_of_order.insert(sequence, payload.to_vec());
    }

    /// Returns true if the next expected payload is already buffered.
    pub fn has_buffered_in_order(&self) -> bool {
        self.out_of_order.exists(self.expected_sequence)
    }

    /// Takes the next expected payload out of the buffer.
    pub fn take_buffered_in_order(&mut self) -> Option<Vec<u8>> {
        let payload = self.out_of_order.remove(self.expected_sequence)?;
        self.expected_sequence = self.expected_sequence.wrapping_add(1);
        Some(payload)
    }

    /// Snapshot of the counters, RTT included.
    pub fn statistics(&self) -> ReliableStatistics {
        ReliableStatistics {
            rtt: self.rtt.rtt(),
            rtt_variance: self.rtt.rtt_variance(),
            resend_timeout: self.resend_timeout(),
            ..self.statistics.clone()
        }
    }
}
