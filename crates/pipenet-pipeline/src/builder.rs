//! Pipeline construction and the per-driver pipeline list.

use pipenet_core::{constants::MAX_PIPELINES, Config, ErrorKind, Result};
use pipenet_protocol::PipelineId;

use crate::{
    processor::ConnectionPipelines,
    stage::{PipelineStage, StageParameters},
};

/// Collects stages in send order.
///
/// ```ignore
/// let builder = PipelineBuilder::new()
///     .with_stage(FragmentationStage::new())
///     .with_stage(ReliableSequencedStage::new());
/// let id = driver.create_pipeline(builder)?;
/// ```
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<Box<dyn PipelineStage>>,
}

impl PipelineBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    ///
    /// Header space is carved back to front: the first stage's header sits next
    /// to the payload and the last stage's header directly follows the
    /// connection header. Receive unwinds the stages in reverse order.
    pub fn with_stage(mut self, stage: impl PipelineStage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Appends an already boxed stage.
    pub fn push_stage(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    /// Number of stages added so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stage was added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Sizes every stage and fixes the buffer layout.
    ///
    /// `protocol_header` is the largest connection header the driver's
    /// protocol puts in front of pipeline output.
    pub fn build(self, config: &Config, protocol_header: usize) -> Result<Pipeline> {
        let mut stages = self.stages;
        let mut available = datagram_payload(config, protocol_header)?;
        let mut header_capacity = vec![0; stages.len()];

        for (index, stage) in stages.iter_mut().enumerate().rev() {
            let capacity = stage.static_initialize(&StageParameters { config, max_packet_payload: available })?;
            if capacity.header_capacity >= available {
                return Err(ErrorKind::InvalidConfiguration("stage headers exceed the message size"));
            }
            header_capacity[index] = capacity.header_capacity;
            available = capacity.payload_capacity.unwrap_or(available - capacity.header_capacity);
        }

        let mut send_headroom = vec![protocol_header; stages.len()];
        let mut headroom = protocol_header;
        for index in (0..stages.len()).rev() {
            headroom += header_capacity[index];
            send_headroom[index] = headroom;
        }

        Ok(Pipeline { stages, header_capacity, send_headroom, protocol_header, max_payload: available })
    }
}

fn datagram_payload(config: &Config, protocol_header: usize) -> Result<usize> {
    (config.max_message_size as usize)
        .checked_sub(protocol_header)
        .filter(|&size| size > 0)
        .ok_or(ErrorKind::InvalidConfiguration("max_message_size is smaller than the protocol header"))
}

/// An ordered list of stages with a fixed layout, shared by every connection.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<Box<dyn PipelineStage>>,
    header_capacity: Vec<usize>,
    send_headroom: Vec<usize>,
    protocol_header: usize,
    max_payload: usize,
}

impl Pipeline {
    /// Number of stages.
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Stage at `index`.
    pub fn stage(&self, index: usize) -> Option<&dyn PipelineStage> {
        self.stages.get(index).map(Box::as_ref)
    }

    /// Largest payload accepted by a send on this pipeline.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Header bytes stage `index` declared.
    pub fn header_capacity(&self, index: usize) -> usize {
        self.header_capacity[index]
    }

    /// Headroom a send buffer needs when entering stage `index`: that stage,
    /// every outer stage and the connection header.
    pub fn send_headroom(&self, index: usize) -> usize {
        self.send_headroom.get(index).copied().unwrap_or(self.protocol_header)
    }

    /// Bytes of scratch needed to process any packet of this pipeline.
    pub fn buffer_capacity(&self) -> usize {
        self.send_headroom(0) + self.max_payload
    }

    pub(crate) fn stages(&self) -> &[Box<dyn PipelineStage>] {
        &self.stages
    }
}

/// Every pipeline of one driver, indexed by [`PipelineId`].
///
/// Slot zero always holds the null pipeline. Pipelines can only be added
/// while no connection exists; the driver enforces that.
#[derive(Debug)]
pub struct PipelineRegistry {
    pipelines: Vec<Pipeline>,
    config: Config,
    protocol_header: usize,
}

impl PipelineRegistry {
    /// Creates a registry holding only the null pipeline.
    pub fn new(config: &Config, protocol_header: usize) -> Result<Self> {
        let null = PipelineBuilder::new().build(config, protocol_header)?;
        Ok(Self { pipelines: vec![null], config: config.clone(), protocol_header })
    }

    /// Builds and registers a pipeline.
    pub fn add(&mut self, builder: PipelineBuilder) -> Result<PipelineId> {
        if self.pipelines.len() >= MAX_PIPELINES {
            return Err(ErrorKind::InvalidConfiguration("too many pipelines"));
        }
        let pipeline = builder.build(&self.config, self.protocol_header)?;
        let id = PipelineId(self.pipelines.len() as u8);
        self.pipelines.push(pipeline);
        Ok(id)
    }

    /// Pipeline with the given id.
    pub fn get(&self, id: PipelineId) -> Option<&Pipeline> {
        self.pipelines.get(id.index())
    }

    /// Returns true if `id` names a registered pipeline.
    pub fn contains(&self, id: PipelineId) -> bool {
        id.index() < self.pipelines.len()
    }

    /// Number of pipelines, the null pipeline included.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Always false, the null pipeline is always present.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Largest scratch buffer any pipeline needs.
    pub fn buffer_capacity(&self) -> usize {
        self.pipelines.iter().map(Pipeline::buffer_capacity).max().unwrap_or(0)
    }

    /// Creates the per-connection state of every pipeline.
    pub fn create_connection(&self) -> ConnectionPipelines {
        ConnectionPipelines::new(self)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Pipeline> {
        self.pipelines.iter()
    }
}
