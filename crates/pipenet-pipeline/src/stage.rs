//! The contract between the pipeline processor and its stages.
//!
//! A stage is registered once per pipeline as a [`PipelineStage`]. When a
//! connection is created, every stage hands out a [`StageConnection`] holding
//! that connection's private state. The processor drives those per-connection
//! objects on both paths:
//!
//! - on send, stages run in declaration order. Each one may prepend a header of
//!   at most its declared `header_capacity` in front of the contents.
//! - on receive, stages run in reverse order. Each one strips its header with
//!   [`PacketBuffer::advance`] and leaves the inner contents in place.
//!
//! An empty buffer means there is nothing left to hand on. Stages are invoked
//! with an empty buffer when they asked to be resumed or updated.

use std::{fmt, time::Instant};

use bitflags::bitflags;
use pipenet_core::{Config, PacketBuffer, Result};
use pipenet_protocol::PipelineId;

use crate::statistics::StageStatistics;

bitflags! {
    /// Follow-up work a stage asks the processor to schedule.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StageRequests: u8 {
        /// Invoke this stage again, with an empty buffer, once the current packet is done.
        const RESUME = 0b0001;
        /// Invoke this stage on the next update of the same path.
        const UPDATE = 0b0010;
        /// Receive path only: invoke this stage's send side on the next send update.
        const SEND_UPDATE = 0b0100;
        /// Receive path only: discard the packet.
        const ERROR = 0b1000;
    }
}

/// Passed to every stage invocation.
#[derive(Debug, Clone, Copy)]
pub struct StageContext {
    /// Time of the current tick or send call.
    pub now: Instant,
    /// Pipeline being processed.
    pub pipeline: PipelineId,
    /// Position of the stage in its pipeline.
    pub stage: usize,
}

/// Input to [`PipelineStage::static_initialize`].
#[derive(Debug, Clone, Copy)]
pub struct StageParameters<'a> {
    /// Driver configuration.
    pub config: &'a Config,
    /// Bytes this stage may emit per datagram, its own header included.
    pub max_packet_payload: usize,
}

/// Sizes a stage declares when its pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageCapacity {
    /// Largest header the stage prepends on send.
    pub header_capacity: usize,
    /// Largest input the stage accepts on send. `None` means whatever fits
    /// after the header in one datagram.
    pub payload_capacity: Option<usize>,
}

/// A stage type registered in a pipeline, shared by every connection.
pub trait PipelineStage: fmt::Debug + Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Fixes the stage's sizes. Runs once, when the pipeline is built,
    /// from the outermost stage inwards.
    fn static_initialize(&mut self, parameters: &StageParameters<'_>) -> Result<StageCapacity>;

    /// Creates the state of one connection.
    fn initialize_connection(&self) -> Box<dyn StageConnection>;
}

/// Per-connection state of one stage.
pub trait StageConnection: fmt::Debug + Send {
    /// Processes outbound contents. An error aborts the send.
    fn send(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests) -> Result<()>;

    /// Processes inbound contents.
    fn receive(&mut self, context: &StageContext, buffer: &mut PacketBuffer, requests: &mut StageRequests);

    /// Packets this stage passes on for one input of `len` bytes.
    fn packets_for(&self, _len: usize) -> usize {
        1
    }

    /// Inputs the stage can take right now without failing. `None` is unbounded.
    fn send_room(&self) -> Option<usize> {
        None
    }

    /// Counters exposed through the driver, if the stage keeps any.
    fn statistics(&self) -> Option<StageStatistics> {
        None
    }
}
