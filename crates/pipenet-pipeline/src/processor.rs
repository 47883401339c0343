//! Runs a connection's packets through its pipeline stages.

use std::time::Instant;

use pipenet_core::{ErrorKind, PacketBuffer, Result, StatusCode};
use pipenet_protocol::PipelineId;
use tracing::{trace, warn};

use crate::{
    builder::{Pipeline, PipelineRegistry},
    stage::{StageConnection, StageContext, StageRequests},
    statistics::StageStatistics,
};

/// Receives a finished datagram: pipeline id plus stage output, with headroom
/// left for the connection header.
pub type EmitFn<'a> = dyn FnMut(PipelineId, &mut PacketBuffer) -> Result<()> + 'a;

/// Receives one payload delivered by a pipeline.
pub type DeliverFn<'a> = dyn FnMut(PipelineId, &[u8]) + 'a;

type StageUpdate = (PipelineId, usize);

/// Stage state of every pipeline for one connection, plus its scratch buffer
/// and pending update requests.
#[derive(Debug)]
pub struct ConnectionPipelines {
    stages: Vec<Vec<Box<dyn StageConnection>>>,
    buffer: PacketBuffer,
    resume: Vec<usize>,
    send_updates: Vec<StageUpdate>,
    receive_updates: Vec<StageUpdate>,
}

impl ConnectionPipelines {
    /// Initializes every stage of every pipeline for a new connection.
    pub fn new(registry: &PipelineRegistry) -> Self {
        let stages = registry
            .iter()
            .map(|pipeline| pipeline.stages().iter().map(|stage| stage.initialize_connection()).collect())
            .collect();
        Self {
            stages,
            buffer: PacketBuffer::with_capacity(registry.buffer_capacity()),
            resume: Vec::new(),
            send_updates: Vec::new(),
            receive_updates: Vec::new(),
        }
    }

    /// Returns true if a send-side stage asked to be updated.
    pub fn has_send_updates(&self) -> bool {
        !self.send_updates.is_empty()
    }

    /// Returns true if a receive-side stage asked to be updated.
    pub fn has_receive_updates(&self) -> bool {
        !self.receive_updates.is_empty()
    }

    /// Counters of one stage.
    pub fn stage_statistics(&self, pipeline: PipelineId, stage: usize) -> Option<StageStatistics> {
        self.stages.get(pipeline.index())?.get(stage)?.statistics()
    }

    /// Sends `payload` through `pipeline`. Returns the number of datagrams emitted.
    ///
    /// Zero-length payloads are only valid on the null pipeline, where they
    /// serve as keep-alives.
    pub fn process_send(
        &mut self,
        registry: &PipelineRegistry,
        id: PipelineId,
        now: Instant,
        payload: &[u8],
        emit: &mut EmitFn<'_>,
    ) -> Result<usize> {
        let pipeline = registry.get(id).ok_or(StatusCode::ArgumentMismatch)?;
        if payload.len() > pipeline.max_payload() {
            return Err(StatusCode::PacketOverflow.into());
        }
        if payload.is_empty() && pipeline.stage_count() > 0 {
            return Err(StatusCode::ArgumentMismatch.into());
        }
        self.check_send_room(pipeline, id, payload.len())?;

        self.buffer.reset(pipeline.send_headroom(0));
        self.buffer.set(payload);
        if pipeline.stage_count() == 0 {
            emit(id, &mut self.buffer)?;
            return Ok(1);
        }
        self.run_send(pipeline, id, now, 0, emit)
    }

    /// Fails before anything is sent if a stage cannot take every packet the
    /// payload turns into.
    fn check_send_room(&self, pipeline: &Pipeline, id: PipelineId, len: usize) -> Result<()> {
        let Some(stages) = self.stages.get(id.index()) else { return Ok(()) };
        let (mut packets, mut len) = (1usize, len);
        for (index, stage) in stages.iter().enumerate() {
            if stage.send_room().is_some_and(|room| room < packets) {
                trace!(pipeline = id.0, stage = index, packets, "stage has no room for the send");
                return Err(ErrorKind::OutgoingQueueIsFull);
            }
            let split = stage.packets_for(len);
            len = len.div_ceil(split) + pipeline.header_capacity(index);
            packets = packets.saturating_mul(split);
        }
        Ok(())
    }

    /// Passes a received pipeline payload through the stages in reverse order.
    /// Returns the number of payloads delivered, resumed ones included.
    pub fn process_receive(
        &mut self,
        registry: &PipelineRegistry,
        id: PipelineId,
        now: Instant,
        payload: &[u8],
        deliver: &mut DeliverFn<'_>,
    ) -> usize {
        let Some(pipeline) = registry.get(id) else {
            warn!(pipeline = id.0, "dropping payload for unknown pipeline");
            return 0;
        };

        self.buffer.reset(0);
        self.buffer.set(payload);
        match pipeline.stage_count() {
            0 if self.buffer.is_empty() => 0,
            0 => {
                deliver(id, self.buffer.as_slice());
                1
            }
            count => self.run_receive(id, now, count - 1, deliver),
        }
    }

    /// Re-runs send stages that requested an update. Returns the number of
    /// datagrams emitted, or the first emit error. Failed updates stay queued.
    pub fn run_send_updates(&mut self, registry: &PipelineRegistry, now: Instant, emit: &mut EmitFn<'_>) -> Result<usize> {
        let updates = std::mem::take(&mut self.send_updates);
        let mut emitted = 0;
        let mut first_error = None;

        for (id, stage) in updates {
            let Some(pipeline) = registry.get(id) else { continue };
            self.buffer.reset(pipeline.send_headroom(stage));
            match self.run_send(pipeline, id, now, stage, emit) {
                Ok(count) => emitted += count,
                Err(error) => {
                    push_unique(&mut self.send_updates, (id, stage));
                    first_error.get_or_insert(error);
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(emitted),
        }
    }

    /// Re-runs receive stages that requested an update. Returns the number of
    /// payloads delivered.
    pub fn run_receive_updates(&mut self, now: Instant, deliver: &mut DeliverFn<'_>) -> usize {
        let updates = std::mem::take(&mut self.receive_updates);
        let mut delivered = 0;
        for (id, stage) in updates {
            if stage >= self.stages.get(id.index()).map_or(0, Vec::len) {
                continue;
            }
            self.buffer.reset(0);
            delivered += self.run_receive(id, now, stage, deliver);
        }
        delivered
    }

    fn run_send(
        &mut self,
        pipeline: &Pipeline,
        id: PipelineId,
        now: Instant,
        start: usize,
        emit: &mut EmitFn<'_>,
    ) -> Result<usize> {
        let Self { stages, buffer, resume, send_updates, .. } = self;
        let stages = &mut stages[id.index()];
        resume.clear();

        let mut emitted = 0;
        let mut next = start;
        loop {
            let mut index = next;
            let mut reached_end = true;
            while index < stages.len() {
                let context = StageContext { now, pipeline: id, stage: index };
                let mut requests = StageRequests::empty();
                let headroom = buffer.headroom();

                stages[index].send(&context, buffer, &mut requests)?;

                let used = headroom.saturating_sub(buffer.headroom());
                if used > pipeline.header_capacity(index) {
                    panic!(
                        "stage {} of pipeline {} wrote {} header bytes but declared {}",
                        index,
                        id,
                        used,
                        pipeline.header_capacity(index)
                    );
                }
                if requests.contains(StageRequests::RESUME) {
                    resume.push(index);
                }
                if requests.contains(StageRequests::UPDATE) {
                    push_unique(send_updates, (id, index));
                }
                if buffer.is_empty() {
                    reached_end = false;
                    break;
                }
                index += 1;
            }

            if reached_end {
                emit(id, buffer)?;
                emitted += 1;
            }

            match resume.pop() {
                Some(stage) => {
                    trace!(pipeline = id.0, stage, "resuming send stage");
                    buffer.reset(pipeline.send_headroom(stage));
                    next = stage;
                }
                None => return Ok(emitted),
            }
        }
    }

    fn run_receive(&mut self, id: PipelineId, now: Instant, start: usize, deliver: &mut DeliverFn<'_>) -> usize {
        let Self { stages, buffer, resume, send_updates, receive_updates } = self;
        let stages = &mut stages[id.index()];
        resume.clear();

        let mut delivered = 0;
        let mut next = start;
        loop {
            let mut reached_end = true;
            for index in (0..=next).rev() {
                let context = StageContext { now, pipeline: id, stage: index };
                let mut requests = StageRequests::empty();

                stages[index].receive(&context, buffer, &mut requests);

                if requests.contains(StageRequests::RESUME) {
                    resume.push(index);
                }
                if requests.contains(StageRequests::UPDATE) {
                    push_unique(receive_updates, (id, index));
                }
                if requests.contains(StageRequests::SEND_UPDATE) {
                    push_unique(send_updates, (id, index));
                }
                if requests.contains(StageRequests::ERROR) {
                    warn!(pipeline = id.0, stage = index, "stage rejected received packet");
                    buffer.clear();
                }
                if buffer.is_empty() {
                    reached_end = false;
                    break;
                }
            }

            if reached_end {
                deliver(id, buffer.as_slice());
                delivered += 1;
            }

            match resume.pop() {
                Some(stage) => {
                    trace!(pipeline = id.0, stage, "resuming receive stage");
                    buffer.reset(0);
                    next = stage;
                }
                None => return delivered,
            }
        }
    }
}

fn push_unique(updates: &mut Vec<StageUpdate>, update: StageUpdate) {
    if !updates.contains(&update) {
        updates.push(update);
    }
}
