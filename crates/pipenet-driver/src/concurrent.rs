//! Sending from several threads during one tick.
//!
//! [`ConcurrentDriver`] borrows the driver for as long as the sends run, so
//! nothing else can touch it until the view is dropped. Each connection can be
//! used by one send at a time; a second concurrent send on the same
//! connection fails with [`StatusCode::ParallelForErr`] instead of blocking.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::{MutexGuard, TryLockError},
    time::Instant,
};

use pipenet_core::{Result, StatusCode};
use pipenet_pipeline::PipelineRegistry;
use pipenet_protocol::{DataStreamWriter, PipelineId};

use crate::{
    connection::{Connection, ConnectionList},
    send::{payload_capacity, Outbound, SendState, SendTarget},
};

/// Thread-shareable send-only view of a [`NetworkDriver`](crate::NetworkDriver).
#[derive(Clone, Copy)]
pub struct ConcurrentDriver<'a> {
    pipelines: &'a PipelineRegistry,
    connections: &'a ConnectionList,
    outbound: Outbound<'a>,
    now: Instant,
}

impl fmt::Debug for ConcurrentDriver<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentDriver")
            .field("connections", &self.connections.live_count())
            .field("pipelines", &self.pipelines.len())
            .finish()
    }
}

impl<'a> ConcurrentDriver<'a> {
    pub(crate) fn new(
        pipelines: &'a PipelineRegistry,
        connections: &'a ConnectionList,
        outbound: Outbound<'a>,
        now: Instant,
    ) -> Self {
        Self { pipelines, connections, outbound, now }
    }

    /// Reserves a payload writer and locks `connection` for this thread.
    ///
    /// `required_size` zero reserves the pipeline's maximum payload.
    pub fn begin_send(
        &self,
        pipeline: PipelineId,
        connection: Connection,
        required_size: usize,
    ) -> Result<ConcurrentSendWriter<'a>> {
        let connections: &'a ConnectionList = self.connections;
        let data = connections.get(connection)?;
        let size = payload_capacity(self.pipelines, data, pipeline, required_size)?;

        let state = match data.send.try_lock() {
            Ok(state) => state,
            Err(TryLockError::WouldBlock) => return Err(StatusCode::ParallelForErr.into()),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        Ok(ConcurrentSendWriter {
            connection,
            pipeline,
            target: SendTarget::of(data),
            state,
            writer: DataStreamWriter::new(size),
        })
    }

    /// Sends the payload and unlocks the connection. Returns the payload size.
    pub fn end_send(&self, writer: ConcurrentSendWriter<'a>) -> Result<usize> {
        let ConcurrentSendWriter { target, mut state, writer, pipeline, .. } = writer;
        if writer.has_failed_writes() {
            return Err(StatusCode::PacketOverflow.into());
        }
        self.outbound.send_payload(self.pipelines, &target, &mut state, pipeline, self.now, writer.as_slice())?;
        Ok(writer.length())
    }

    /// Unlocks the connection without sending.
    pub fn abort_send(&self, writer: ConcurrentSendWriter<'a>) {
        drop(writer);
    }

    /// Sends `payload` in one call.
    pub fn send(&self, pipeline: PipelineId, connection: Connection, payload: &[u8]) -> Result<usize> {
        let mut writer = self.begin_send(pipeline, connection, payload.len())?;
        writer.write_bytes(payload);
        self.end_send(writer)
    }
}

/// Payload under construction on a [`ConcurrentDriver`]. Holds the connection's send lock.
pub struct ConcurrentSendWriter<'a> {
    connection: Connection,
    pipeline: PipelineId,
    target: SendTarget,
    state: MutexGuard<'a, SendState>,
    writer: DataStreamWriter,
}

impl ConcurrentSendWriter<'_> {
    /// Connection the payload is for.
    pub fn connection(&self) -> Connection {
        self.connection
    }

    /// Pipeline the payload goes through.
    pub fn pipeline(&self) -> PipelineId {
        self.pipeline
    }
}

impl fmt::Debug for ConcurrentSendWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentSendWriter")
            .field("connection", &self.connection)
            .field("pipeline", &self.pipeline)
            .field("length", &self.writer.length())
            .finish()
    }
}

impl Deref for ConcurrentSendWriter<'_> {
    type Target = DataStreamWriter;

    fn deref(&self) -> &DataStreamWriter {
        &self.writer
    }
}

impl DerefMut for ConcurrentSendWriter<'_> {
    fn deref_mut(&mut self) -> &mut DataStreamWriter {
        &mut self.writer
    }
}
