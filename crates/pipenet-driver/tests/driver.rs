//! End-to-end tests for the network driver.
//!
//! Drivers talk through an in-process hub and share a manual clock, so every
//! tick is deterministic. A tick is one `schedule_update` on the client
//! followed by one on the server.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use pipenet_core::{Config, Endpoint, ErrorKind, ManualClock, NetworkInterface, PacketBuffer, ReceiveQueue, SendQueue, StatusCode};
use pipenet_driver::{
    Connection, ConnectionState, DisconnectReason, EventKind, IpcHub, IpcInterface, NetworkDriver, UdpInterface,
};
use pipenet_pipeline::{
    ApplyMode, PipelineBuilder, ReliableSequencedStage, SimulatorParameters, SimulatorStage, UnreliableSequencedStage,
};
use pipenet_protocol::{NetworkProtocol, PacketHeader, PacketType, PipelineId, ProcessPacketCommand, UdpProtocol};

const SERVER: u32 = 1;

type Received = (EventKind, Connection, Vec<u8>);

fn driver(hub: &IpcHub, clock: &ManualClock, config: Config) -> NetworkDriver {
    NetworkDriver::with_config_and_clock(IpcInterface::new(hub.clone()), config, Arc::new(clock.clone())).unwrap()
}

fn drain(driver: &mut NetworkDriver) -> Vec<Received> {
    let mut received = Vec::new();
    while let Some(event) = driver.pop_event() {
        received.push((event.kind, event.connection, driver.event_payload(&event).to_vec()));
    }
    received
}

fn payloads(events: &[Received]) -> Vec<Vec<u8>> {
    events.iter().filter(|(kind, ..)| *kind == EventKind::Data).map(|(.., payload)| payload.clone()).collect()
}

struct Harness {
    hub: IpcHub,
    clock: ManualClock,
    server: NetworkDriver,
    client: NetworkDriver,
}

impl Harness {
    fn new(config: Config) -> Self {
        let hub = IpcHub::new();
        let clock = ManualClock::new();
        let mut server = driver(&hub, &clock, config.clone());
        server.bind(&Endpoint::ipc(SERVER)).unwrap();
        server.listen().unwrap();
        let client = driver(&hub, &clock, config);
        Self { hub, clock, server, client }
    }

    /// Registers the same pipeline on both ends.
    fn pipeline(&mut self, build: impl Fn() -> PipelineBuilder) -> PipelineId {
        let id = self.server.create_pipeline(build()).unwrap();
        assert_eq!(self.client.create_pipeline(build()).unwrap(), id);
        id
    }

    fn tick(&mut self) -> (Vec<Received>, Vec<Received>) {
        self.client.schedule_update().unwrap();
        let client = drain(&mut self.client);
        self.server.schedule_update().unwrap();
        let server = drain(&mut self.server);
        (client, server)
    }

    /// Runs the handshake. Returns the server-side and client-side handles.
    fn connect(&mut self) -> (Connection, Connection) {
        let client = self.client.connect(&Endpoint::ipc(SERVER)).unwrap();
        assert_eq!(self.client.connection_state(client), ConnectionState::Connecting);

        let (_, server_events) = self.tick();
        assert!(server_events.is_empty());
        let server = self.server.accept().unwrap();
        assert_eq!(self.server.connection_state(server), ConnectionState::Connected);

        let (client_events, _) = self.tick();
        assert_eq!(client_events, vec![(EventKind::Connect, client, Vec::new())]);
        assert_eq!(self.client.connection_state(client), ConnectionState::Connected);
        (server, client)
    }
}

#[test]
fn test_connect_exchange_disconnect() {
    let mut harness = Harness::new(Config::default());
    let (server, client) = harness.connect();
    assert_eq!(harness.server.remote_endpoint(server).unwrap(), harness.client.local_endpoint().unwrap());

    assert_eq!(harness.client.send(PipelineId::NULL, client, b"hello").unwrap(), 5);
    let (_, server_events) = harness.tick();
    assert_eq!(server_events, vec![(EventKind::Data, server, b"hello".to_vec())]);

    harness.server.send(PipelineId::NULL, server, b"world").unwrap();
    let (client_events, _) = harness.tick();
    assert_eq!(client_events, vec![(EventKind::Data, client, b"world".to_vec())]);

    harness.client.disconnect(client).unwrap();
    assert_eq!(harness.client.connection_state(client), ConnectionState::Disconnected);
    let (client_events, server_events) = harness.tick();
    assert!(client_events.is_empty());
    assert_eq!(server_events, vec![(EventKind::Disconnect(DisconnectReason::ClosedByRemote), server, Vec::new())]);
    assert_eq!(harness.server.connection_state(server), ConnectionState::Disconnected);

    let statistics = harness.server.statistics();
    assert_eq!(statistics.data_events, 1);
    assert!(statistics.datagrams_received >= 3);
}

#[test]
fn test_recycled_slot_rejects_old_handle() {
    let mut harness = Harness::new(Config::default());
    let (old_server, old_client) = harness.connect();

    harness.client.disconnect(old_client).unwrap();
    let (_, server_events) = harness.tick();
    assert_eq!(server_events.len(), 1);

    let (new_server, new_client) = harness.connect();
    assert_eq!(new_server.id(), old_server.id());
    assert_ne!(new_server.version(), old_server.version());
    assert_eq!(new_client.id(), old_client.id());

    let result = harness.server.send(PipelineId::NULL, old_server, b"stale");
    assert!(matches!(result, Err(ErrorKind::Status(StatusCode::VersionMismatch))));
    assert_eq!(harness.server.connection_state(old_server), ConnectionState::Disconnected);
    harness.server.send(PipelineId::NULL, new_server, b"fresh").unwrap();
}

#[test]
fn test_repeated_request_is_answered_without_new_connection() {
    let mut harness = Harness::new(Config::default());
    let client = harness.client.connect(&Endpoint::ipc(SERVER)).unwrap();
    harness.tick();

    // The client retries before it processes the accept already on its way.
    harness.clock.advance(harness.client.config().connect_timeout);
    let (client_events, _) = harness.tick();
    assert_eq!(client_events, vec![(EventKind::Connect, client, Vec::new())]);

    assert!(harness.server.accept().is_some());
    assert!(harness.server.accept().is_none());

    // The second accept is ignored.
    let (client_events, server_events) = harness.tick();
    assert!(client_events.is_empty());
    assert!(server_events.is_empty());
    assert_eq!(harness.client.connection_state(client), ConnectionState::Connected);
}

#[test]
fn test_reject_when_not_listening() {
    let hub = IpcHub::new();
    let clock = ManualClock::new();
    let mut server = driver(&hub, &clock, Config::default());
    server.bind(&Endpoint::ipc(SERVER)).unwrap();
    let mut client = driver(&hub, &clock, Config::default());

    let connection = client.connect(&Endpoint::ipc(SERVER)).unwrap();
    client.schedule_update().unwrap();
    server.schedule_update().unwrap();
    assert!(server.accept().is_none());

    client.schedule_update().unwrap();
    let events = drain(&mut client);
    assert_eq!(events, vec![(EventKind::Disconnect(DisconnectReason::ClosedByRemote), connection, Vec::new())]);
}

#[test]
fn test_reject_beyond_max_connections() {
    let config = Config { max_connections: Some(1), ..Config::default() };
    let mut harness = Harness::new(config.clone());
    harness.connect();

    let mut second = driver(&harness.hub, &harness.clock, config);
    let connection = second.connect(&Endpoint::ipc(SERVER)).unwrap();
    second.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    assert!(harness.server.accept().is_none());

    second.schedule_update().unwrap();
    assert_eq!(
        drain(&mut second),
        vec![(EventKind::Disconnect(DisconnectReason::ClosedByRemote), connection, Vec::new())]
    );
}

#[test]
fn test_connect_gives_up_after_max_attempts() {
    let config =
        Config { connect_timeout: Duration::from_millis(100), max_connect_attempts: 3, ..Config::default() };
    let hub = IpcHub::new();
    let clock = ManualClock::new();
    let mut client = driver(&hub, &clock, config);
    let connection = client.connect(&Endpoint::ipc(99)).unwrap();

    for _ in 0..3 {
        client.schedule_update().unwrap();
        assert!(drain(&mut client).is_empty());
        assert_eq!(client.connection_state(connection), ConnectionState::Connecting);
        clock.advance(Duration::from_millis(100));
    }

    client.schedule_update().unwrap();
    assert_eq!(
        drain(&mut client),
        vec![(EventKind::Disconnect(DisconnectReason::MaxConnectionAttempts), connection, Vec::new())]
    );
    assert_eq!(client.connection_state(connection), ConnectionState::Disconnected);
}

#[test]
fn test_idle_connection_times_out() {
    let config = Config { disconnect_timeout: Duration::from_secs(1), heartbeat_timeout: None, ..Config::default() };
    let mut harness = Harness::new(config);
    let (server, client) = harness.connect();

    harness.clock.advance(Duration::from_secs(1));
    let (client_events, server_events) = harness.tick();
    assert_eq!(client_events, vec![(EventKind::Disconnect(DisconnectReason::Timeout), client, Vec::new())]);
    assert_eq!(server_events, vec![(EventKind::Disconnect(DisconnectReason::Timeout), server, Vec::new())]);
}

#[test]
fn test_heartbeats_keep_connection_alive() {
    let config = Config {
        disconnect_timeout: Duration::from_secs(1),
        heartbeat_timeout: Some(Duration::from_millis(200)),
        ..Config::default()
    };
    let mut harness = Harness::new(config);
    let (server, client) = harness.connect();

    for _ in 0..30 {
        harness.clock.advance(Duration::from_millis(100));
        let (client_events, server_events) = harness.tick();
        assert!(client_events.is_empty());
        assert!(server_events.is_empty());
    }
    assert_eq!(harness.server.connection_state(server), ConnectionState::Connected);
    assert_eq!(harness.client.connection_state(client), ConnectionState::Connected);
}

#[test]
fn test_data_completes_handshake_when_accept_is_lost() {
    let hub = IpcHub::new();
    let clock = ManualClock::new();
    let protocol = UdpProtocol::new();
    let mut fake_server = IpcInterface::new(hub.clone());
    fake_server.bind(&Endpoint::ipc(SERVER)).unwrap();

    let mut client = driver(&hub, &clock, Config::default());
    let connection = client.connect(&Endpoint::ipc(SERVER)).unwrap();
    client.schedule_update().unwrap();

    let mut inbound = ReceiveQueue::new(8, 1400);
    fake_server.schedule_receive(&mut inbound).unwrap();
    let (client_endpoint, request) = inbound.get(0).unwrap();
    let ProcessPacketCommand::ConnectionRequest { session_token } = protocol.process_receive(&client_endpoint, request)
    else {
        panic!("expected a connection request");
    };

    // Skip the accept and answer with data carrying our token.
    let mut buffer = PacketBuffer::with_capacity(64);
    buffer.reset(protocol.max_header_size());
    buffer.set(b"early");
    protocol.write_header(&mut buffer, &PacketHeader::data(session_token, Some(777), PipelineId::NULL)).unwrap();
    let outbound = SendQueue::new(8, 1400);
    outbound.push(client_endpoint, buffer.as_slice()).unwrap();
    fake_server.schedule_send(&outbound).unwrap();

    client.schedule_update().unwrap();
    assert_eq!(
        drain(&mut client),
        vec![(EventKind::Connect, connection, Vec::new()), (EventKind::Data, connection, b"early".to_vec())]
    );

    // The client now addresses us with our token and no longer repeats its own.
    client.send(PipelineId::NULL, connection, b"reply").unwrap();
    client.schedule_update().unwrap();
    inbound.clear();
    fake_server.schedule_receive(&mut inbound).unwrap();
    let (_, datagram) = inbound.get(0).unwrap();
    assert_eq!(
        protocol.process_receive(&client_endpoint, datagram),
        ProcessPacketCommand::Data { session_token: 777, pipeline: PipelineId::NULL, payload: b"reply" }
    );
}

fn send_request(interface: &mut IpcInterface, protocol: &UdpProtocol, session_token: u16) {
    let mut buffer = PacketBuffer::with_capacity(protocol.max_header_size());
    buffer.reset(protocol.max_header_size());
    protocol.write_header(&mut buffer, &PacketHeader::control(PacketType::ConnectionRequest, session_token)).unwrap();
    let outbound = SendQueue::new(1, 64);
    outbound.push(Endpoint::ipc(SERVER), buffer.as_slice()).unwrap();
    interface.schedule_send(&outbound).unwrap();
}

#[test]
fn test_request_with_other_token_from_connected_peer_is_ignored() {
    let hub = IpcHub::new();
    let clock = ManualClock::new();
    let protocol = UdpProtocol::new();
    let mut server = driver(&hub, &clock, Config::default());
    server.bind(&Endpoint::ipc(SERVER)).unwrap();
    server.listen().unwrap();
    let mut peer = IpcInterface::new(hub.clone());
    peer.bind(&Endpoint::ipc(5)).unwrap();
    let mut inbound = ReceiveQueue::new(8, 1400);

    send_request(&mut peer, &protocol, 0x1111);
    server.schedule_update().unwrap();
    let connection = server.accept().unwrap();
    assert_eq!(peer.schedule_receive(&mut inbound).unwrap(), 1);
    let (_, accept) = inbound.get(0).unwrap();
    assert!(matches!(
        protocol.process_receive(&Endpoint::ipc(SERVER), accept),
        ProcessPacketCommand::ConnectionAccept { session_token: 0x1111, .. }
    ));

    send_request(&mut peer, &protocol, 0x2222);
    server.schedule_update().unwrap();
    assert!(drain(&mut server).is_empty());
    assert!(server.accept().is_none());
    assert_eq!(server.connection_state(connection), ConnectionState::Connected);
    assert_eq!(server.remote_endpoint(connection).unwrap(), Endpoint::ipc(5));
    inbound.clear();
    assert_eq!(peer.schedule_receive(&mut inbound).unwrap(), 0);

    // The original token is still answered.
    send_request(&mut peer, &protocol, 0x1111);
    server.schedule_update().unwrap();
    assert!(server.accept().is_none());
    assert_eq!(peer.schedule_receive(&mut inbound).unwrap(), 1);
}

#[test]
fn test_event_buffer_grows_instead_of_dropping_acknowledged_data() {
    let config = Config { receive_data_capacity: 8, ..Config::default() };
    let mut harness = Harness::new(config);
    let pipeline = harness.pipeline(|| PipelineBuilder::new().with_stage(ReliableSequencedStage::new()));
    let (_, client) = harness.connect();

    let messages: Vec<Vec<u8>> = (0u8..3).map(|n| vec![b'm' + n; 8]).collect();
    for message in &messages {
        harness.client.send(pipeline, client, message).unwrap();
    }

    let (_, server_events) = harness.tick();
    assert_eq!(payloads(&server_events), messages);
    assert_eq!(harness.server.statistics().data_events, 3);

    // Nothing is held back for a later tick.
    for _ in 0..5 {
        harness.clock.advance(Duration::from_millis(300));
        let (_, server_events) = harness.tick();
        assert!(payloads(&server_events).is_empty());
    }
}

#[test]
fn test_reliable_pipeline_delivers_every_message_after_loss() {
    let mut harness = Harness::new(Config::default());
    let server_pipeline = harness.server.create_pipeline(PipelineBuilder::new().with_stage(ReliableSequencedStage::new())).unwrap();
    let drop_fourth = SimulatorParameters {
        packet_drop_interval: 4,
        random_seed: Some(7),
        mode: ApplyMode::Send,
        ..SimulatorParameters::default()
    };
    let pipeline = harness
        .client
        .create_pipeline(
            PipelineBuilder::new()
                .with_stage(ReliableSequencedStage::new())
                .with_stage(SimulatorStage::new(drop_fourth)),
        )
        .unwrap();
    assert_eq!(pipeline, server_pipeline);
    let (server, client) = harness.connect();

    for index in 0..5u8 {
        harness.client.send(pipeline, client, &[b'm', index]).unwrap();
    }
    let (_, server_events) = harness.tick();
    assert_eq!(payloads(&server_events), vec![b"m\x00".to_vec(), b"m\x01".to_vec(), b"m\x02".to_vec()]);

    // Server acks 0-2 and 4, then the client learns 3 is missing.
    harness.tick();
    harness.tick();
    harness.clock.advance(Duration::from_millis(250));
    let (_, server_events) = harness.tick();
    assert_eq!(payloads(&server_events), vec![b"m\x03".to_vec(), b"m\x04".to_vec()]);
    assert!(server_events.iter().all(|(_, connection, _)| *connection == server));

    assert_eq!(harness.server.statistics().data_events, 5);
    let reliable = harness.client.stage_statistics(client, pipeline, 0).unwrap();
    assert_eq!(reliable.as_reliable().unwrap().packets_resent, 1);
    let simulator = harness.client.stage_statistics(client, pipeline, 1).unwrap();
    assert_eq!(simulator.as_simulator().unwrap().packets_dropped, 1);
}

#[test]
fn test_writer_reserves_and_reports_overflow() {
    let mut harness = Harness::new(Config::default());
    let (server, client) = harness.connect();
    let max = harness.client.max_payload_size(PipelineId::NULL).unwrap();

    let writer = harness.client.begin_send(PipelineId::NULL, client, 0).unwrap();
    assert_eq!(writer.capacity(), max);
    harness.client.abort_send(writer);

    let result = harness.client.begin_send(PipelineId::NULL, client, max + 1);
    assert!(matches!(result, Err(ErrorKind::Status(StatusCode::PacketOverflow))));
    let result = harness.client.begin_send(PipelineId(9), client, 1);
    assert!(matches!(result, Err(ErrorKind::Status(StatusCode::ArgumentMismatch))));

    let mut writer = harness.client.begin_send(PipelineId::NULL, client, 4).unwrap();
    writer.write_bytes(b"toolong");
    let result = harness.client.end_send(writer);
    assert!(matches!(result, Err(ErrorKind::Status(StatusCode::PacketOverflow))));

    let mut writer = harness.client.begin_send(PipelineId::NULL, client, 0).unwrap();
    writer.write_ushort(513);
    writer.write_bytes(b"ok");
    assert_eq!(writer.connection(), client);
    assert_eq!(harness.client.end_send(writer).unwrap(), 4);

    harness.client.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    let event = harness.server.pop_event().unwrap();
    assert_eq!(event.connection, server);
    assert_eq!(event.payload_len(), 4);
    let mut reader = harness.server.event_reader(&event);
    assert_eq!(reader.read_ushort(), 513);
    assert_eq!(reader.read_slice(2), Some(&b"ok"[..]));
}

#[test]
fn test_pop_event_for_connection() {
    let mut harness = Harness::new(Config::default());
    let (first_server, first_client) = harness.connect();

    let mut second = driver(&harness.hub, &harness.clock, Config::default());
    let second_client = second.connect(&Endpoint::ipc(SERVER)).unwrap();
    second.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    let second_server = harness.server.accept().unwrap();
    second.schedule_update().unwrap();
    assert_eq!(drain(&mut second).len(), 1);

    harness.client.send(PipelineId::NULL, first_client, b"one").unwrap();
    second.send(PipelineId::NULL, second_client, b"two").unwrap();
    harness.client.schedule_update().unwrap();
    second.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    assert_eq!(harness.server.pending_events(), 2);

    let event = harness.server.pop_event_for_connection(second_server).unwrap();
    assert_eq!(harness.server.event_payload(&event), b"two");
    assert!(harness.server.pop_event_for_connection(second_server).is_none());
    let event = harness.server.pop_event().unwrap();
    assert_eq!(event.connection, first_server);
}

#[test]
fn test_concurrent_sends_on_separate_connections() {
    let mut harness = Harness::new(Config::default());
    let pipeline = harness.pipeline(|| PipelineBuilder::new().with_stage(UnreliableSequencedStage::new()));
    let (first_server, first_client) = harness.connect();

    let mut second = driver(&harness.hub, &harness.clock, Config::default());
    second.create_pipeline(PipelineBuilder::new().with_stage(UnreliableSequencedStage::new())).unwrap();
    let second_client = second.connect(&Endpoint::ipc(SERVER)).unwrap();
    second.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    let second_server = harness.server.accept().unwrap();
    second.schedule_update().unwrap();
    drain(&mut second);

    let view = harness.server.to_concurrent();
    thread::scope(|scope| {
        for connection in [first_server, second_server] {
            scope.spawn(move || {
                for index in 0..10u8 {
                    view.send(pipeline, connection, &[index]).unwrap();
                }
            });
        }
    });
    harness.server.schedule_update().unwrap();

    let expected: Vec<Vec<u8>> = (0..10u8).map(|index| vec![index]).collect();
    harness.client.schedule_update().unwrap();
    let events = drain(&mut harness.client);
    assert_eq!(payloads(&events), expected);
    assert!(events.iter().all(|(_, connection, _)| *connection == first_client));

    second.schedule_update().unwrap();
    assert_eq!(payloads(&drain(&mut second)), expected);
}

#[test]
fn test_concurrent_send_on_busy_connection_fails() {
    let mut harness = Harness::new(Config::default());
    let (server, client) = harness.connect();

    let view = harness.server.to_concurrent();
    let mut writer = view.begin_send(PipelineId::NULL, server, 0).unwrap();
    writer.write_bytes(b"first");

    let busy = thread::scope(|scope| scope.spawn(|| view.begin_send(PipelineId::NULL, server, 0).map(drop)).join());
    assert!(matches!(busy, Ok(Err(ErrorKind::Status(StatusCode::ParallelForErr)))));

    assert_eq!(view.end_send(writer).unwrap(), 5);
    view.send(PipelineId::NULL, server, b"second").unwrap();
    harness.server.schedule_update().unwrap();

    harness.client.schedule_update().unwrap();
    let events = drain(&mut harness.client);
    assert_eq!(payloads(&events), vec![b"first".to_vec(), b"second".to_vec()]);
    assert!(events.iter().all(|(_, connection, _)| *connection == client));
}

#[test]
fn test_events_are_discarded_by_the_next_update() {
    let mut harness = Harness::new(Config::default());
    let (_, client) = harness.connect();

    harness.client.send(PipelineId::NULL, client, b"ignored").unwrap();
    harness.client.schedule_update().unwrap();
    harness.server.schedule_update().unwrap();
    assert_eq!(harness.server.pending_events(), 1);

    harness.server.schedule_update().unwrap();
    assert_eq!(harness.server.pending_events(), 0);
}

#[test]
fn test_udp_loopback_session() {
    let mut server = NetworkDriver::new(UdpInterface::default()).unwrap();
    let any_local = server.create_endpoint("127.0.0.1:0").unwrap();
    server.bind(&any_local).unwrap();
    server.listen().unwrap();
    let server_endpoint = server.local_endpoint().unwrap();

    let mut client = NetworkDriver::new(UdpInterface::default()).unwrap();
    client.bind(&any_local).unwrap();
    let connection = client.connect(&server_endpoint).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut accepted = None;
    let mut received = Vec::new();
    while received.is_empty() && Instant::now() < deadline {
        client.schedule_update().unwrap();
        for (kind, ..) in drain(&mut client) {
            if kind == EventKind::Connect {
                client.send(PipelineId::NULL, connection, b"over udp").unwrap();
            }
        }
        server.schedule_update().unwrap();
        accepted = accepted.or_else(|| server.accept());
        received.extend(payloads(&drain(&mut server)));
        thread::sleep(Duration::from_millis(2));
    }

    assert!(accepted.is_some());
    assert_eq!(received, vec![b"over udp".to_vec()]);
}
