//! Outbound path shared by the driver and its concurrent view.

use std::{
    ops::{Deref, DerefMut},
    time::Instant,
};

use pipenet_core::{Endpoint, PacketBuffer, Result, SendQueue, StatusCode};
use pipenet_pipeline::{ConnectionPipelines, PipelineRegistry};
use pipenet_protocol::{DataStreamWriter, NetworkProtocol, PacketHeader, PipelineId};

use crate::connection::{Connection, ConnectionData, ConnectionState};

/// Per-connection state touched by sends. Guarded by the connection's send lock.
#[derive(Debug)]
pub(crate) struct SendState {
    pub pipelines: ConnectionPipelines,
    pub last_send: Instant,
}

impl SendState {
    pub fn new(pipelines: ConnectionPipelines, now: Instant) -> Self {
        Self { pipelines, last_send: now }
    }
}

/// Addressing for data packets of one connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendTarget {
    pub endpoint: Endpoint,
    pub session_token: u16,
    pub connection_token: Option<u16>,
}

impl SendTarget {
    /// Our token rides along until the remote has sent us data.
    pub fn of(data: &ConnectionData) -> Self {
        Self {
            endpoint: data.endpoint,
            session_token: data.send_token,
            connection_token: (!data.did_receive_data).then_some(data.receive_token),
        }
    }
}

/// Frames datagrams with the protocol header and commits them to the send queue.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Outbound<'a> {
    pub protocol: &'a dyn NetworkProtocol,
    pub queue: &'a SendQueue,
}

impl Outbound<'_> {
    pub fn send_control(&self, endpoint: Endpoint, header: &PacketHeader) -> Result<()> {
        let headroom = self.protocol.max_header_size();
        let mut buffer = PacketBuffer::with_capacity(headroom);
        buffer.reset(headroom);
        self.protocol.write_header(&mut buffer, header)?;
        self.queue.push(endpoint, buffer.as_slice())?;
        Ok(())
    }

    /// Runs `payload` through `pipeline`. Returns the number of datagrams queued.
    pub fn send_payload(
        &self,
        registry: &PipelineRegistry,
        target: &SendTarget,
        state: &mut SendState,
        pipeline: PipelineId,
        now: Instant,
        payload: &[u8],
    ) -> Result<usize> {
        state.last_send = now;
        state.pipelines.process_send(registry, pipeline, now, payload, &mut |id: PipelineId, buffer: &mut PacketBuffer| {
            self.emit(target, id, buffer)
        })
    }

    /// Runs pending send-side stage updates.
    pub fn send_updates(
        &self,
        registry: &PipelineRegistry,
        target: &SendTarget,
        state: &mut SendState,
        now: Instant,
    ) -> Result<usize> {
        let sent = state.pipelines.run_send_updates(registry, now, &mut |id: PipelineId, buffer: &mut PacketBuffer| {
            self.emit(target, id, buffer)
        })?;
        if sent > 0 {
            state.last_send = now;
        }
        Ok(sent)
    }

    fn emit(&self, target: &SendTarget, pipeline: PipelineId, buffer: &mut PacketBuffer) -> Result<()> {
        let header = PacketHeader::data(target.session_token, target.connection_token, pipeline);
        self.protocol.write_header(buffer, &header)?;
        self.queue.push(target.endpoint, buffer.as_slice())?;
        Ok(())
    }
}

/// Payload under construction, returned by `begin_send`.
///
/// Write through the [`DataStreamWriter`] it dereferences to, then hand it to
/// `end_send` or `abort_send`.
#[derive(Debug)]
pub struct SendWriter {
    pub(crate) connection: Connection,
    pub(crate) pipeline: PipelineId,
    pub(crate) writer: DataStreamWriter,
}

impl SendWriter {
    /// Connection the payload is for.
    pub fn connection(&self) -> Connection {
        self.connection
    }

    /// Pipeline the payload goes through.
    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }
}

impl Deref for SendWriter {
    type Target = DataStreamWriter;

    fn deref(&self) -> &DataStreamWriter {
        &self.writer
    }
}

impl DerefMut for SendWriter {
    fn deref_mut(&mut self) -> &mut DataStreamWriter {
        &mut self.writer
    }
}

/// Payload bytes a writer for `pipeline` gets. Zero asks for the pipeline maximum.
pub(crate) fn payload_capacity(
    registry: &PipelineRegistry,
    data: &ConnectionData,
    pipeline: PipelineId,
    required_size: usize,
) -> Result<usize> {
    if data.state != ConnectionState::Connected {
        return Err(StatusCode::StateMismatch.into());
    }
    let max = registry.get(pipeline).ok_or(StatusCode::ArgumentMismatch)?.max_payload();
    match required_size {
        0 => Ok(max),
        size if size <= max => Ok(size),
        _ => Err(StatusCode::PacketOverflow.into()),
    }
}
