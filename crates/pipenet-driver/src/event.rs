//! Events handed from the driver to the application.
//!
//! Events live for one tick. Data events point into a flat payload buffer
//! owned by the queue; both are rewound at the start of every update. The
//! buffer grows when a tick delivers more than it holds, since the pipelines
//! have already acknowledged what they deliver.

use std::collections::VecDeque;

use pipenet_protocol::PipelineId;
use tracing::debug;

use crate::connection::Connection;

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DisconnectReason {
    /// Closed without a more specific reason.
    Default = 0,
    /// Nothing was received for the disconnect timeout.
    Timeout = 1,
    /// The remote never answered our connection requests.
    MaxConnectionAttempts = 2,
    /// The remote closed or refused the connection.
    ClosedByRemote = 3,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Our connection request was accepted.
    Connect,
    /// The connection is gone.
    Disconnect(DisconnectReason),
    /// A payload arrived.
    Data,
}

/// A single event. The payload of a data event is read through the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Event type.
    pub kind: EventKind,
    /// Connection the event belongs to.
    pub connection: Connection,
    /// Pipeline a data event arrived on. Null for other events.
    pub pipeline: PipelineId,
    offset: usize,
    len: usize,
}

impl Event {
    /// Payload size of a data event.
    pub fn payload_len(&self) -> usize {
        self.len
    }
}

#[derive(Debug)]
pub(crate) struct EventQueue {
    events: VecDeque<Event>,
    data: Vec<u8>,
}

impl EventQueue {
    pub fn new(data_capacity: usize) -> Self {
        Self { events: VecDeque::new(), data: Vec::with_capacity(data_capacity) }
    }

    /// Discards everything. Returns how many events were never popped.
    pub fn clear(&mut self) -> usize {
        let unconsumed = self.events.len();
        self.events.clear();
        self.data.clear();
        unconsumed
    }

    pub fn push(&mut self, kind: EventKind, connection: Connection) {
        self.events.push_back(Event { kind, connection, pipeline: PipelineId::NULL, offset: 0, len: 0 });
    }

    /// Queues a data event, growing the payload buffer if needed.
    pub fn push_data(&mut self, connection: Connection, pipeline: PipelineId, payload: &[u8]) {
        let offset = self.data.len();
        if offset + payload.len() > self.data.capacity() {
            self.data.reserve(payload.len());
            debug!(capacity = self.data.capacity(), "grew event payload buffer");
        }
        self.data.extend_from_slice(payload);
        self.events.push_back(Event { kind: EventKind::Data, connection, pipeline, offset, len: payload.len() });
    }

    pub fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    pub fn pop_for_connection(&mut self, connection: Connection) -> Option<Event> {
        let position = self.events.iter().position(|event| event.connection == connection)?;
        self.events.remove(position)
    }

    pub fn payload(&self, event: &Event) -> &[u8] {
        self.data.get(event.offset..event.offset + event.len).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(id: u32) -> Connection {
        Connection::new(id, 1)
    }

    #[test]
    fn test_events_pop_in_order() {
        let mut queue = EventQueue::new(64);
        queue.push(EventKind::Connect, connection(0));
        queue.push_data(connection(0), PipelineId(1), b"abc");
        queue.push(EventKind::Disconnect(DisconnectReason::Timeout), connection(0));

        assert_eq!(queue.pop().unwrap().kind, EventKind::Connect);
        let data = queue.pop().unwrap();
        assert_eq!(data.kind, EventKind::Data);
        assert_eq!(data.pipeline, PipelineId(1));
        assert_eq!(queue.payload(&data), b"abc");
        assert_eq!(queue.pop().unwrap().kind, EventKind::Disconnect(DisconnectReason::Timeout));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_pop_for_connection_skips_others() {
        let mut queue = EventQueue::new(64);
        queue.push_data(connection(0), PipelineId::NULL, b"a");
        queue.push_data(connection(1), PipelineId::NULL, b"b");
        queue.push_data(connection(0), PipelineId::NULL, b"c");

        let event = queue.pop_for_connection(connection(1)).unwrap();
        assert_eq!(queue.payload(&event), b"b");
        assert!(queue.pop_for_connection(connection(1)).is_none());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_payload_buffer_grows_past_initial_capacity() {
        let mut queue = EventQueue::new(4);
        queue.push_data(connection(0), PipelineId::NULL, b"abc");
        queue.push_data(connection(0), PipelineId::NULL, b"defgh");
        assert_eq!(queue.len(), 2);

        let first = queue.pop().unwrap();
        let second = queue.pop().unwrap();
        assert_eq!(queue.payload(&first), b"abc");
        assert_eq!(queue.payload(&second), b"defgh");
    }

    #[test]
    fn test_clear_reports_unconsumed() {
        let mut queue = EventQueue::new(16);
        queue.push(EventKind::Connect, connection(0));
        queue.push_data(connection(0), PipelineId::NULL, b"xyz");
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.clear(), 0);
        queue.push_data(connection(0), PipelineId::NULL, &[0; 16]);
    }
}
