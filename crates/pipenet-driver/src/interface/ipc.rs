use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use pipenet_core::{Endpoint, ErrorKind, NetworkInterface, ReceiveQueue, Result, SendQueue, StatusCode};
use tracing::trace;

type Datagram = (Endpoint, Vec<u8>);

#[derive(Debug, Default)]
struct HubState {
    next_id: u32,
    mailboxes: HashMap<u32, Sender<Datagram>>,
}

impl HubState {
    fn register(&mut self, requested: u32) -> Result<(u32, Receiver<Datagram>)> {
        let id = match requested {
            0 => loop {
                self.next_id = self.next_id.wrapping_add(1).max(1);
                if !self.mailboxes.contains_key(&self.next_id) {
                    break self.next_id;
                }
            },
            id if self.mailboxes.contains_key(&id) => return Err(ErrorKind::AddressInUse),
            id => id,
        };
        let (sender, receiver) = unbounded();
        self.mailboxes.insert(id, sender);
        Ok((id, receiver))
    }
}

/// Shared switchboard connecting [`IpcInterface`]s of one process.
///
/// Clones refer to the same hub.
#[derive(Clone, Default)]
pub struct IpcHub {
    state: Arc<Mutex<HubState>>,
}

impl IpcHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bound interfaces.
    pub fn bound_count(&self) -> usize {
        self.lock().mailboxes.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for IpcHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpcHub").field("bound", &self.bound_count()).finish()
    }
}

/// In-process datagram interface. Endpoints are [`Endpoint::ipc`] ids.
///
/// Datagrams to an id nobody is bound to are dropped, as on a real network.
#[derive(Debug)]
pub struct IpcInterface {
    hub: IpcHub,
    id: Option<u32>,
    receiver: Option<Receiver<Datagram>>,
}

impl IpcInterface {
    /// Creates an unbound interface attached to `hub`.
    pub fn new(hub: IpcHub) -> Self {
        Self { hub, id: None, receiver: None }
    }
}

impl NetworkInterface for IpcInterface {
    fn bind(&mut self, endpoint: &Endpoint) -> Result<()> {
        if self.id.is_some() {
            return Err(StatusCode::StateMismatch.into());
        }
        let requested = endpoint.ipc_id().ok_or(ErrorKind::InvalidEndpoint)?;
        let (id, receiver) = self.hub.lock().register(requested)?;
        trace!(id, "ipc interface bound");
        self.id = Some(id);
        self.receiver = Some(receiver);
        Ok(())
    }

    fn local_endpoint(&self) -> Result<Endpoint> {
        self.id.map(Endpoint::ipc).ok_or(ErrorKind::NotBound)
    }

    fn any_endpoint(&self) -> Endpoint {
        Endpoint::ipc(0)
    }

    fn create_endpoint(&self, address: &str) -> Result<Endpoint> {
        let id = address.strip_prefix("ipc:").unwrap_or(address);
        id.parse::<u32>().map(Endpoint::ipc).map_err(|_| ErrorKind::InvalidEndpoint)
    }

    fn schedule_receive(&mut self, queue: &mut ReceiveQueue) -> Result<usize> {
        let receiver = self.receiver.as_ref().ok_or(ErrorKind::NotBound)?;
        let mut received = 0;
        while !queue.is_full() {
            match receiver.try_recv() {
                Ok((from, data)) => {
                    if queue.push(from, &data) {
                        received += 1;
                    }
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        Ok(received)
    }

    fn schedule_send(&mut self, queue: &SendQueue) -> Result<usize> {
        let local = self.local_endpoint()?;
        let hub = self.hub.lock();
        let mut sent = 0;
        for packet in queue.drain() {
            let mailbox = packet.endpoint.ipc_id().and_then(|id| hub.mailboxes.get(&id));
            match mailbox {
                Some(mailbox) if mailbox.send((local, packet.data.clone())).is_ok() => sent += 1,
                _ => trace!(to = %packet.endpoint, "dropping datagram to unbound ipc endpoint"),
            }
            queue.recycle(packet);
        }
        Ok(sent)
    }
}

impl Drop for IpcInterface {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.hub.lock().mailboxes.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(hub: &IpcHub, id: u32) -> IpcInterface {
        let mut interface = IpcInterface::new(hub.clone());
        interface.bind(&Endpoint::ipc(id)).unwrap();
        interface
    }

    #[test]
    fn test_any_endpoint_assigns_fresh_ids() {
        let hub = IpcHub::new();
        let a = bound(&hub, 0);
        let b = bound(&hub, 0);
        assert_ne!(a.local_endpoint().unwrap(), b.local_endpoint().unwrap());
        assert_eq!(hub.bound_count(), 2);

        drop(a);
        assert_eq!(hub.bound_count(), 1);
    }

    #[test]
    fn test_taken_id_is_rejected() {
        let hub = IpcHub::new();
        let _first = bound(&hub, 7);
        let mut second = IpcInterface::new(hub);
        assert!(matches!(second.bind(&Endpoint::ipc(7)), Err(ErrorKind::AddressInUse)));
    }

    #[test]
    fn test_datagrams_travel_between_interfaces() {
        let hub = IpcHub::new();
        let mut a = bound(&hub, 1);
        let mut b = bound(&hub, 2);

        let queue = SendQueue::new(8, 64);
        queue.push(Endpoint::ipc(2), b"hello").unwrap();
        queue.push(Endpoint::ipc(9), b"nobody").unwrap();
        assert_eq!(a.schedule_send(&queue).unwrap(), 1);
        assert_eq!(queue.in_use(), 0);

        let mut received = ReceiveQueue::new(8, 64);
        assert_eq!(b.schedule_receive(&mut received).unwrap(), 1);
        assert_eq!(received.get(0), Some((Endpoint::ipc(1), &b"hello"[..])));
    }

    #[test]
    fn test_receive_stops_when_queue_is_full() {
        let hub = IpcHub::new();
        let mut a = bound(&hub, 1);
        let mut b = bound(&hub, 2);

        let queue = SendQueue::new(8, 64);
        for byte in 0..3u8 {
            queue.push(Endpoint::ipc(2), &[byte]).unwrap();
        }
        a.schedule_send(&queue).unwrap();

        let mut received = ReceiveQueue::new(2, 64);
        assert_eq!(b.schedule_receive(&mut received).unwrap(), 2);
        received.clear();
        assert_eq!(b.schedule_receive(&mut received).unwrap(), 1);
        assert_eq!(received.get(0).map(|(_, data)| data.to_vec()), Some(vec![2]));
    }

    #[test]
    fn test_create_endpoint() {
        let interface = IpcInterface::new(IpcHub::new());
        assert_eq!(interface.create_endpoint("ipc:12").unwrap(), Endpoint::ipc(12));
        assert_eq!(interface.create_endpoint("12").unwrap(), Endpoint::ipc(12));
        assert!(interface.create_endpoint("127.0.0.1:80").is_err());
        assert!(matches!(interface.local_endpoint(), Err(ErrorKind::NotBound)));
    }
}
