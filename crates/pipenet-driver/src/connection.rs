//! Generational connection table.
//!
//! Connections live in a flat slot array. A [`Connection`] handle is the slot
//! index plus the slot's version; freeing a slot bumps the version, so a
//! handle that outlived its connection is rejected instead of silently
//! addressing whoever took the slot next. Freed slots are parked until the
//! next update before they can be reused.

use std::{fmt, sync::Mutex, time::Instant};

use pipenet_core::{Endpoint, Result, StatusCode};

use crate::send::SendState;

/// Handle to a connection owned by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Connection {
    id: u32,
    version: u32,
}

impl Connection {
    pub(crate) fn new(id: u32, version: u32) -> Self {
        Self { id, version }
    }

    /// Slot index.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Slot version at the time the connection was created.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns false for the default handle, which never refers to a connection.
    pub fn is_created(&self) -> bool {
        self.version != 0
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id, self.version)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Closed, or the handle is stale.
    #[default]
    Disconnected,
    /// Connection requests are being sent.
    Connecting,
    /// A remote connected to us and waits to be returned by `accept`.
    AwaitingAccept,
    /// Established.
    Connected,
}

#[derive(Debug)]
pub(crate) struct ConnectionData {
    pub endpoint: Endpoint,
    pub state: ConnectionState,
    pub attempts: u32,
    pub last_attempt: Instant,
    pub last_receive: Instant,
    /// Token the remote puts on packets for us.
    pub receive_token: u16,
    /// Token we put on packets for the remote.
    pub send_token: u16,
    pub did_receive_data: bool,
    pub send: Mutex<SendState>,
}

impl ConnectionData {
    pub fn new(endpoint: Endpoint, state: ConnectionState, receive_token: u16, send: SendState, now: Instant) -> Self {
        Self {
            endpoint,
            state,
            attempts: 0,
            last_attempt: now,
            last_receive: now,
            receive_token,
            send_token: 0,
            did_receive_data: false,
            send: Mutex::new(send),
        }
    }

    pub fn is_live(&self) -> bool {
        self.state != ConnectionState::Disconnected
    }
}

#[derive(Debug)]
struct Slot {
    version: u32,
    data: Option<ConnectionData>,
}

#[derive(Debug, Default)]
pub(crate) struct ConnectionList {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending_free: Vec<u32>,
}

impl ConnectionList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once any connection was ever created.
    pub fn has_allocated(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn allocate(&mut self, data: ConnectionData) -> Connection {
        match self.free.pop() {
            Some(id) => {
                let slot = &mut self.slots[id as usize];
                slot.data = Some(data);
                Connection::new(id, slot.version)
            }
            None => {
                let id = self.slots.len() as u32;
                self.slots.push(Slot { version: 1, data: Some(data) });
                Connection::new(id, 1)
            }
        }
    }

    fn slot(&self, connection: Connection) -> Result<&Slot> {
        let slot = self.slots.get(connection.id as usize).ok_or(StatusCode::NetworkIdMismatch)?;
        if slot.version != connection.version || slot.data.is_none() {
            return Err(StatusCode::VersionMismatch.into());
        }
        Ok(slot)
    }

    pub fn get(&self, connection: Connection) -> Result<&ConnectionData> {
        self.slot(connection)?.data.as_ref().ok_or_else(|| StatusCode::VersionMismatch.into())
    }

    pub fn get_mut(&mut self, connection: Connection) -> Result<&mut ConnectionData> {
        self.slot(connection)?;
        self.slots[connection.id as usize].data.as_mut().ok_or_else(|| StatusCode::VersionMismatch.into())
    }

    /// Marks a connection disconnected. Its slot is reused after the next [`ConnectionList::recycle_pending`].
    pub fn release(&mut self, connection: Connection) {
        if let Ok(data) = self.get_mut(connection) {
            if data.is_live() {
                data.state = ConnectionState::Disconnected;
                self.pending_free.push(connection.id);
            }
        }
    }

    /// Frees every released slot. Returns how many were recycled.
    pub fn recycle_pending(&mut self) -> usize {
        let count = self.pending_free.len();
        for id in self.pending_free.drain(..) {
            let slot = &mut self.slots[id as usize];
            slot.data = None;
            slot.version = match slot.version.wrapping_add(1) {
                0 => 1,
                version => version,
            };
            self.free.push(id);
        }
        count
    }

    /// Live connection the remote at `endpoint` addresses with `receive_token`.
    pub fn find(&self, receive_token: u16, endpoint: &Endpoint) -> Option<Connection> {
        self.iter().find(|(_, data)| data.receive_token == receive_token && data.endpoint == *endpoint).map(|(c, _)| c)
    }

    /// Live connection owning `receive_token`, wherever the remote is.
    pub fn find_by_token(&self, receive_token: u16) -> Option<Connection> {
        self.iter().find(|(_, data)| data.receive_token == receive_token).map(|(c, _)| c)
    }

    pub fn find_by_endpoint(&self, endpoint: &Endpoint) -> Option<Connection> {
        self.iter().find(|(_, data)| data.endpoint == *endpoint).map(|(c, _)| c)
    }

    /// Live connections.
    pub fn iter(&self) -> impl Iterator<Item = (Connection, &ConnectionData)> + '_ {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            let data = slot.data.as_ref().filter(|data| data.is_live())?;
            Some((Connection::new(id as u32, slot.version), data))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Connection, &mut ConnectionData)> + '_ {
        self.slots.iter_mut().enumerate().filter_map(|(id, slot)| {
            let version = slot.version;
            let data = slot.data.as_mut().filter(|data| data.is_live())?;
            Some((Connection::new(id as u32, version), data))
        })
    }

    pub fn live_count(&self) -> usize {
        self.iter().count()
    }
}
