//! The network driver.
//!
//! A [`NetworkDriver`] owns one network interface, the connection table, the
//! pipelines and the event queue. Everything happens on
//! [`NetworkDriver::schedule_update`], which runs once per tick:
//!
//! 1. events left over from the previous tick are discarded
//! 2. slots of connections closed last tick are recycled
//! 3. handshake retries, idle timeouts and heartbeats
//! 4. the protocol's own update, if it asks for one
//! 5. timer-driven receive stage updates, then send stage updates
//! 6. datagrams are received and dispatched, then the send queue is flushed

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, PoisonError},
    time::Instant,
};

use pipenet_core::{
    packet_pool::PacketAllocator, Clock, Config, Endpoint, ErrorKind, NetworkInterface, ReceiveQueue, Result,
    SendQueue, StatusCode, SystemClock,
};
use pipenet_pipeline::{PipelineBuilder, PipelineRegistry, StageStatistics};
use pipenet_protocol::{
    DataStreamReader, DataStreamWriter, NetworkProtocol, PacketHeader, PacketType, PipelineId, ProcessPacketCommand,
    UdpProtocol,
};
use rand::random;
use tracing::{debug, error, trace, warn};

use crate::{
    concurrent::ConcurrentDriver,
    connection::{Connection, ConnectionData, ConnectionList, ConnectionState},
    event::{DisconnectReason, Event, EventKind, EventQueue},
    send::{payload_capacity, Outbound, SendState, SendTarget, SendWriter},
};

/// Writers kept around for reuse.
const WRITER_POOL_SIZE: usize = 16;

/// Counters kept by a driver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverStatistics {
    /// Datagrams taken from the interface.
    pub datagrams_received: u64,
    /// Datagrams handed to the interface.
    pub datagrams_sent: u64,
    /// Datagrams that were malformed, unexpected or did not fit the receive queue.
    pub datagrams_dropped: u64,
    /// Data events produced.
    pub data_events: u64,
}

/// Connection-oriented messaging over a datagram interface.
pub struct NetworkDriver {
    config: Config,
    interface: Box<dyn NetworkInterface>,
    protocol: Box<dyn NetworkProtocol>,
    clock: Arc<dyn Clock>,
    pipelines: PipelineRegistry,
    connections: ConnectionList,
    events: EventQueue,
    accept_queue: VecDeque<Connection>,
    send_queue: SendQueue,
    receive_queue: ReceiveQueue,
    writers: PacketAllocator,
    bound: bool,
    listening: bool,
    statistics: DriverStatistics,
}

impl fmt::Debug for NetworkDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkDriver")
            .field("config", &self.config)
            .field("protocol", &self.protocol)
            .field("connections", &self.connections.live_count())
            .field("pipelines", &self.pipelines.len())
            .field("bound", &self.bound)
            .field("listening", &self.listening)
            .field("statistics", &self.statistics)
            .finish()
    }
}

impl NetworkDriver {
    /// Creates a driver over `interface` with the default configuration.
    pub fn new(interface: impl NetworkInterface + 'static) -> Result<Self> {
        Self::with_config(interface, Config::default())
    }

    /// Creates a driver over `interface` with a custom configuration.
    pub fn with_config(interface: impl NetworkInterface + 'static, config: Config) -> Result<Self> {
        Self::with_config_and_clock(interface, config, Arc::new(SystemClock))
    }

    /// Creates a driver reading time from `clock`, for deterministic tests.
    pub fn with_config_and_clock(
        interface: impl NetworkInterface + 'static,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_protocol(Box::new(interface), Box::new(UdpProtocol::new()), config, clock)
    }

    /// Creates a driver with every collaborator supplied by the caller.
    pub fn with_protocol(
        interface: Box<dyn NetworkInterface>,
        protocol: Box<dyn NetworkProtocol>,
        config: Config,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let max_message_size = config.max_message_size as usize;
        let pipelines = PipelineRegistry::new(&config, protocol.max_header_size())?;

        Ok(Self {
            events: EventQueue::new(config.receive_data_capacity),
            send_queue: SendQueue::new(config.send_queue_capacity, max_message_size),
            receive_queue: ReceiveQueue::new(config.receive_queue_capacity, max_message_size),
            writers: PacketAllocator::new(max_message_size, WRITER_POOL_SIZE),
            accept_queue: VecDeque::new(),
            connections: ConnectionList::new(),
            bound: false,
            listening: false,
            statistics: DriverStatistics::default(),
            config,
            interface,
            protocol,
            clock,
            pipelines,
        })
    }

    /// Configuration the driver was created with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Binds the interface to a local endpoint.
    pub fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.bound {
            return Err(StatusCode::StateMismatch.into());
        }
        self.interface.bind(endpoint)?;
        self.bound = true;
        debug!(%endpoint, "bound");
        Ok(())
    }

    /// Starts accepting connection requests.
    pub fn listen(&mut self) -> Result<()> {
        if !self.bound {
            return Err(ErrorKind::NotBound);
        }
        self.interface.listen()?;
        self.listening = true;
        debug!("listening");
        Ok(())
    }

    /// Returns true once [`NetworkDriver::bind`] succeeded.
    pub fn is_bound(&self) -> bool {
        self.bound
    }

    /// Returns true once [`NetworkDriver::listen`] succeeded.
    pub fn is_listening(&self) -> bool {
        self.listening
    }

    /// Endpoint the interface is bound to.
    pub fn local_endpoint(&self) -> Result<Endpoint> {
        self.interface.local_endpoint()
    }

    /// Parses an address understood by the interface.
    pub fn create_endpoint(&self, address: &str) -> Result<Endpoint> {
        self.interface.create_endpoint(address)
    }

    /// Registers a pipeline. Only possible before the first connection exists.
    pub fn create_pipeline(&mut self, builder: PipelineBuilder) -> Result<PipelineId> {
        if self.connections.has_allocated() {
            return Err(ErrorKind::PipelinesLocked);
        }
        let id = self.pipelines.add(builder)?;
        debug!(pipeline = id.0, "created pipeline");
        Ok(id)
    }

    /// Largest payload one send on `pipeline` can carry.
    pub fn max_payload_size(&self, pipeline: PipelineId) -> Option<usize> {
        self.pipelines.get(pipeline).map(|pipeline| pipeline.max_payload())
    }

    /// Starts connecting to `endpoint`. Binds to the any-endpoint first if needed.
    ///
    /// The connection is usable once a [`EventKind::Connect`] event arrives for it.
    pub fn connect(&mut self, endpoint: &Endpoint) -> Result<Connection> {
        if !self.bound {
            let any = self.interface.any_endpoint();
            self.bind(&any)?;
        }

        let now = self.clock.now();
        let receive_token = self.unused_token();
        let send = SendState::new(self.pipelines.create_connection(), now);
        let mut data = ConnectionData::new(*endpoint, ConnectionState::Connecting, receive_token, send, now);
        data.attempts = 1;
        let connection = self.connections.allocate(data);

        let outbound = Outbound { protocol: &*self.protocol, queue: &self.send_queue };
        queue_control(outbound, *endpoint, &PacketHeader::control(PacketType::ConnectionRequest, receive_token));
        debug!(%connection, %endpoint, "connecting");
        Ok(connection)
    }

    /// Returns the next connection made to us, if any.
    pub fn accept(&mut self) -> Option<Connection> {
        while let Some(connection) = self.accept_queue.pop_front() {
            match self.connections.get_mut(connection) {
                Ok(data) if data.state == ConnectionState::AwaitingAccept => {
                    data.state = ConnectionState::Connected;
                    debug!(%connection, endpoint = %data.endpoint, "accepted connection");
                    return Some(connection);
                }
                _ => trace!(%connection, "skipping connection closed before it was accepted"),
            }
        }
        None
    }

    /// Closes a connection. The remote is told if it knows about us.
    pub fn disconnect(&mut self, connection: Connection) -> Result<()> {
        let data = self.connections.get(connection)?;
        match data.state {
            ConnectionState::Disconnected => return Err(StatusCode::StateMismatch.into()),
            ConnectionState::Connected | ConnectionState::AwaitingAccept => {
                let outbound = Outbound { protocol: &*self.protocol, queue: &self.send_queue };
                queue_control(outbound, data.endpoint, &PacketHeader::control(PacketType::Disconnect, data.send_token));
            }
            ConnectionState::Connecting => {}
        }
        self.connections.release(connection);
        debug!(%connection, "disconnected");
        Ok(())
    }

    /// State of a connection. Stale handles report [`ConnectionState::Disconnected`].
    pub fn connection_state(&self, connection: Connection) -> ConnectionState {
        self.connections.get(connection).map_or(ConnectionState::Disconnected, |data| data.state)
    }

    /// Endpoint of the remote side.
    pub fn remote_endpoint(&self, connection: Connection) -> Result<Endpoint> {
        Ok(self.connections.get(connection)?.endpoint)
    }

    /// Reserves a payload writer for `connection` on `pipeline`.
    ///
    /// `required_size` zero reserves the pipeline's maximum payload.
    pub fn begin_send(&mut self, pipeline: PipelineId, connection: Connection, required_size: usize) -> Result<SendWriter> {
        let data = self.connections.get(connection)?;
        let size = payload_capacity(&self.pipelines, data, pipeline, required_size)?;
        let mut buffer = self.writers.allocate();
        buffer.resize(size, 0);
        Ok(SendWriter { connection, pipeline, writer: DataStreamWriter::from_vec(buffer) })
    }

    /// Sends the payload in `writer` through its pipeline. Returns the payload size.
    pub fn end_send(&mut self, writer: SendWriter) -> Result<usize> {
        let SendWriter { connection, pipeline, writer } = writer;
        let result = self.send_written(connection, pipeline, &writer);
        self.writers.deallocate(writer.into_vec());
        result
    }

    /// Drops a reserved writer without sending.
    pub fn abort_send(&mut self, writer: SendWriter) {
        self.writers.deallocate(writer.writer.into_vec());
    }

    /// Sends `payload` in one call.
    pub fn send(&mut self, pipeline: PipelineId, connection: Connection, payload: &[u8]) -> Result<usize> {
        let mut writer = self.begin_send(pipeline, connection, payload.len())?;
        writer.write_bytes(payload);
        self.end_send(writer)
    }

    fn send_written(&mut self, connection: Connection, pipeline: PipelineId, writer: &DataStreamWriter) -> Result<usize> {
        if writer.has_failed_writes() {
            return Err(StatusCode::PacketOverflow.into());
        }
        let now = self.clock.now();
        let data = self.connections.get_mut(connection)?;
        if data.state != ConnectionState::Connected {
            return Err(StatusCode::StateMismatch.into());
        }
        let target = SendTarget::of(data);
        let state = data.send.get_mut().unwrap_or_else(PoisonError::into_inner);
        let outbound = Outbound { protocol: &*self.protocol, queue: &self.send_queue };
        outbound.send_payload(&self.pipelines, &target, state, pipeline, now, writer.as_slice())?;
        Ok(writer.length())
    }

    /// View of the driver that sends from several threads at once.
    pub fn to_concurrent(&mut self) -> ConcurrentDriver<'_> {
        let outbound = Outbound { protocol: &*self.protocol, queue: &self.send_queue };
        ConcurrentDriver::new(&self.pipelines, &self.connections, outbound, self.clock.now())
    }

    /// Pops the oldest event of this tick.
    pub fn pop_event(&mut self) -> Option<Event> {
        self.events.pop()
    }

    /// Pops the oldest event of this tick for one connection.
    pub fn pop_event_for_connection(&mut self, connection: Connection) -> Option<Event> {
        self.events.pop_for_connection(connection)
    }

    /// Payload of a data event. Valid until the next update.
    pub fn event_payload(&self, event: &Event) -> &[u8] {
        self.events.payload(event)
    }

    /// Reader over the payload of a data event.
    pub fn event_reader(&self, event: &Event) -> DataStreamReader<'_> {
        DataStreamReader::new(self.events.payload(event))
    }

    /// Events not popped yet.
    pub fn pending_events(&self) -> usize {
        self.events.len()
    }

    /// Counters of one pipeline stage of a connection.
    pub fn stage_statistics(&self, connection: Connection, pipeline: PipelineId, stage: usize) -> Option<StageStatistics> {
        let data = self.connections.get(connection).ok()?;
        let state = data.send.lock().unwrap_or_else(PoisonError::into_inner);
        state.pipelines.stage_statistics(pipeline, stage)
    }

    /// Driver counters.
    pub fn statistics(&self) -> DriverStatistics {
        self.statistics.clone()
    }

    /// Runs one tick. Events of the previous tick must have been popped by now.
    pub fn schedule_update(&mut self) -> Result<()> {
        let now = self.clock.now();

        #[cfg(feature = "send-leak-check")]
        {
            let leaked = self.send_queue.take_leaked_handles();
            if leaked > 0 {
                error!(leaked, "send handles dropped without end_send or abort_send");
            }
        }

        let unconsumed = self.events.clear();
        if unconsumed > 0 {
            warn!(unconsumed, "discarding events that were not popped before the update");
        }

        let recycled = self.connections.recycle_pending();
        if recycled > 0 {
            trace!(recycled, "recycled connection slots");
        }

        self.check_timeouts(now);

        if self.protocol.needs_update() {
            self.protocol.update(now);
        }

        self.run_receive_updates(now);
        self.run_send_updates(now);

        if !self.bound {
            return Ok(());
        }
        let received = self.receive(now);
        self.flush();
        received
    }

    fn check_timeouts(&mut self, now: Instant) {
        let Self { config, connections, events, pipelines, protocol, send_queue, .. } = self;
        let outbound = Outbound { protocol: &**protocol, queue: send_queue };
        let mut closed = Vec::new();

        for (connection, data) in connections.iter_mut() {
            match data.state {
                ConnectionState::Connecting => {
                    if now.saturating_duration_since(data.last_attempt) < config.connect_timeout {
                        continue;
                    }
                    if data.attempts >= config.max_connect_attempts {
                        debug!(%connection, attempts = data.attempts, "giving up on connection");
                        events.push(EventKind::Disconnect(DisconnectReason::MaxConnectionAttempts), connection);
                        closed.push(connection);
                        continue;
                    }
                    data.attempts += 1;
                    data.last_attempt = now;
                    debug!(%connection, attempt = data.attempts, "retrying connection request");
                    let header = PacketHeader::control(PacketType::ConnectionRequest, data.receive_token);
                    queue_control(outbound, data.endpoint, &header);
                }
                ConnectionState::AwaitingAccept | ConnectionState::Connected => {
                    if now.saturating_duration_since(data.last_receive) >= config.disconnect_timeout {
                        debug!(%connection, "connection timed out");
                        events.push(EventKind::Disconnect(DisconnectReason::Timeout), connection);
                        closed.push(connection);
                        continue;
                    }
                    let Some(heartbeat) = config.heartbeat_timeout else { continue };
                    if data.state != ConnectionState::Connected {
                        continue;
                    }
                    let target = SendTarget::of(data);
                    let state = data.send.get_mut().unwrap_or_else(PoisonError::into_inner);
                    if now.saturating_duration_since(state.last_send) < heartbeat {
                        continue;
                    }
                    trace!(%connection, "sending heartbeat");
                    if let Err(error) = outbound.send_payload(pipelines, &target, state, PipelineId::NULL, now, &[]) {
                        warn!(%connection, %error, "failed to queue heartbeat");
                    }
                }
                ConnectionState::Disconnected => {}
            }
        }

        for connection in closed {
            connections.release(connection);
        }
    }

    fn run_receive_updates(&mut self, now: Instant) {
        let Self { connections, events, statistics, .. } = self;
        for (connection, data) in connections.iter_mut() {
            let state = data.send.get_mut().unwrap_or_else(PoisonError::into_inner);
            if !state.pipelines.has_receive_updates() {
                continue;
            }
            state.pipelines.run_receive_updates(now, &mut |pipeline: PipelineId, payload: &[u8]| {
                push_data_event(events, statistics, connection, pipeline, payload)
            });
        }
    }

    fn run_send_updates(&mut self, now: Instant) {
        let Self { connections, pipelines, protocol, send_queue, .. } = self;
        let outbound = Outbound { protocol: &**protocol, queue: send_queue };
        for (connection, data) in connections.iter_mut() {
            if data.state != ConnectionState::Connected {
                continue;
            }
            let target = SendTarget::of(data);
            let state = data.send.get_mut().unwrap_or_else(PoisonError::into_inner);
            if !state.pipelines.has_send_updates() {
                continue;
            }
            if let Err(error) = outbound.send_updates(pipelines, &target, state, now) {
                warn!(%connection, %error, "send update failed, retrying next tick");
            }
        }
    }

    fn receive(&mut self, now: Instant) -> Result<()> {
        let mut queue = std::mem::take(&mut self.receive_queue);
        queue.clear();
        let dropped = queue.dropped_count();
        let result = self.interface.schedule_receive(&mut queue);

        for (endpoint, datagram) in queue.iter() {
            self.process_datagram(now, endpoint, datagram);
        }
        self.statistics.datagrams_received += queue.len() as u64;
        self.statistics.datagrams_dropped += queue.dropped_count() - dropped;
        self.receive_queue = queue;

        if let Err(error) = &result {
            error!(%error, "failed to receive from the interface");
        }
        result.map(drop)
    }

    fn flush(&mut self) {
        match self.interface.schedule_send(&self.send_queue) {
            Ok(sent) => self.statistics.datagrams_sent += sent as u64,
            Err(error) => error!(%error, "failed to flush the send queue"),
        }
    }

    fn process_datagram(&mut self, now: Instant, endpoint: Endpoint, datagram: &[u8]) {
        match self.protocol.process_receive(&endpoint, datagram) {
            ProcessPacketCommand::Drop => self.statistics.datagrams_dropped += 1,
            ProcessPacketCommand::AddressUpdate { new_endpoint, session_token } => {
                let moved = self.connections.find_by_token(session_token);
                if let Some(data) = moved.and_then(|connection| self.connections.get_mut(connection).ok()) {
                    debug!(from = %data.endpoint, to = %new_endpoint, "remote endpoint changed");
                    data.endpoint = new_endpoint;
                }
            }
            ProcessPacketCommand::BindAccept => debug!(%endpoint, "bind confirmed by the medium"),
            ProcessPacketCommand::ConnectionRequest { session_token } => {
                self.on_connection_request(now, endpoint, session_token)
            }
            ProcessPacketCommand::ConnectionAccept { session_token, connection_token } => {
                self.on_connection_accept(now, endpoint, session_token, connection_token)
            }
            ProcessPacketCommand::ConnectionReject { session_token } => {
                match self.connections.find(session_token, &endpoint) {
                    Some(connection) if self.connection_state(connection) == ConnectionState::Connecting => {
                        debug!(%connection, "connection rejected");
                        self.close_by_remote(connection);
                    }
                    _ => trace!(%endpoint, "ignoring reject for an unknown connection"),
                }
            }
            ProcessPacketCommand::Disconnect { session_token } => match self.connections.find(session_token, &endpoint) {
                Some(connection) => {
                    debug!(%connection, "closed by remote");
                    self.close_by_remote(connection);
                }
                None => trace!(%endpoint, "ignoring disconnect for an unknown connection"),
            },
            ProcessPacketCommand::Data { session_token, pipeline, payload } => {
                self.on_data(now, endpoint, session_token, None, pipeline, payload)
            }
            ProcessPacketCommand::DataWithImplicitConnectionAccept {
                session_token,
                connection_token,
                pipeline,
                payload,
            } => self.on_data(now, endpoint, session_token, Some(connection_token), pipeline, payload),
        }
    }

    fn on_connection_request(&mut self, now: Instant, endpoint: Endpoint, session_token: u16) {
        let outbound = Outbound { protocol: &*self.protocol, queue: &self.send_queue };

        if let Some(existing) = self.connections.find_by_endpoint(&endpoint) {
            let Ok(data) = self.connections.get_mut(existing) else { return };
            if data.state != ConnectionState::Connecting && data.send_token == session_token {
                // Our accept was lost; answer again without creating anything.
                data.last_receive = now;
                debug!(connection = %existing, "repeating accept");
                queue_control(outbound, endpoint, &accept_header(session_token, data.receive_token));
            } else {
                warn!(connection = %existing, %endpoint, session_token, "ignoring connection request with a mismatched token");
            }
            return;
        }

        let at_capacity = self.config.max_connections.is_some_and(|max| self.connections.live_count() >= max);
        if !self.listening || at_capacity {
            debug!(%endpoint, listening = self.listening, "rejecting connection request");
            queue_control(outbound, endpoint, &PacketHeader::control(PacketType::ConnectionReject, session_token));
            return;
        }

        let receive_token = self.unused_token();
        let send = SendState::new(self.pipelines.create_connection(), now);
        let mut data = ConnectionData::new(endpoint, ConnectionState::AwaitingAccept, receive_token, send, now);
        data.send_token = session_token;
        let connection = self.connections.allocate(data);
        self.accept_queue.push_back(connection);

        debug!(%connection, %endpoint, "connection requested");
        queue_control(outbound, endpoint, &accept_header(session_token, receive_token));
    }

    fn on_connection_accept(&mut self, now: Instant, endpoint: Endpoint, session_token: u16, connection_token: u16) {
        let Some(connection) = self.connections.find(session_token, &endpoint) else {
            trace!(%endpoint, "ignoring accept for an unknown connection");
            return;
        };
        let Ok(data) = self.connections.get_mut(connection) else { return };
        data.last_receive = now;
        if data.state != ConnectionState::Connecting {
            trace!(%connection, "ignoring repeated accept");
            return;
        }
        data.send_token = connection_token;
        data.state = ConnectionState::Connected;
        self.events.push(EventKind::Connect, connection);
        debug!(%connection, "connected");
    }

    fn on_data(
        &mut self,
        now: Instant,
        endpoint: Endpoint,
        session_token: u16,
        connection_token: Option<u16>,
        pipeline: PipelineId,
        payload: &[u8],
    ) {
        let Some(connection) = self.connections.find(session_token, &endpoint) else {
            self.statistics.datagrams_dropped += 1;
            trace!(%endpoint, session_token, "dropping data for an unknown connection");
            return;
        };

        let Self { connections, events, pipelines, statistics, .. } = self;
        let Ok(data) = connections.get_mut(connection) else { return };
        if data.state == ConnectionState::Connecting {
            let Some(token) = connection_token else {
                statistics.datagrams_dropped += 1;
                debug!(%connection, "dropping data for a connection that is not established");
                return;
            };
            data.send_token = token;
            data.state = ConnectionState::Connected;
            events.push(EventKind::Connect, connection);
            debug!(%connection, "connected by data");
        }
        data.last_receive = now;
        data.did_receive_data = true;

        let state = data.send.get_mut().unwrap_or_else(PoisonError::into_inner);
        let delivered = state.pipelines.process_receive(pipelines, pipeline, now, payload, &mut |id: PipelineId, bytes: &[u8]| {
            push_data_event(events, statistics, connection, id, bytes)
        });
        trace!(%connection, pipeline = pipeline.0, delivered, "processed data");
    }

    fn close_by_remote(&mut self, connection: Connection) {
        self.events.push(EventKind::Disconnect(DisconnectReason::ClosedByRemote), connection);
        self.connections.release(connection);
    }

    fn unused_token(&self) -> u16 {
        loop {
            let token = random::<u16>();
            if self.connections.find_by_token(token).is_none() {
                return token;
            }
        }
    }
}

fn accept_header(session_token: u16, receive_token: u16) -> PacketHeader {
    PacketHeader {
        kind: PacketType::ConnectionAccept,
        session_token,
        connection_token: Some(receive_token),
        pipeline: None,
    }
}

fn queue_control(outbound: Outbound<'_>, endpoint: Endpoint, header: &PacketHeader) {
    if let Err(error) = outbound.send_control(endpoint, header) {
        warn!(%endpoint, kind = ?header.kind, %error, "failed to queue control packet");
    }
}

fn push_data_event(
    events: &mut EventQueue,
    statistics: &mut DriverStatistics,
    connection: Connection,
    pipeline: PipelineId,
    payload: &[u8],
) {
    events.push_data(connection, pipeline, payload);
    statistics.data_events += 1;
}
