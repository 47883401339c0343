//! Pooled datagram queues shared between the driver and a network interface.
//!
//! Outbound datagrams go through a two-phase protocol: [`SendQueue::begin_send`]
//! reserves a pooled slot, the caller fills it, and [`SendQueue::end_send`]
//! commits it to the FIFO the interface drains. [`SendQueue::abort_send`]
//! returns the slot untouched. Inbound datagrams are appended to a flat
//! [`ReceiveQueue`] that the driver walks once per tick.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex, PoisonError,
};

use crossbeam_channel::{unbounded, Receiver, Sender, TryIter};

use crate::{
    endpoint::Endpoint,
    error::{Result, StatusCode},
};

/// A simple packet allocator that reuses buffers.
#[derive(Debug)]
pub struct PacketAllocator {
    pool: Vec<Vec<u8>>,
    buffer_size: usize,
    max_pool_size: usize,
}

impl PacketAllocator {
    /// Creates a new packet allocator.
    pub fn new(buffer_size: usize, max_pool_size: usize) -> Self {
        Self { pool: Vec::with_capacity(max_pool_size), buffer_size, max_pool_size }
    }

    /// Allocates a buffer from the pool or creates a new one.
    pub fn allocate(&mut self) -> Vec<u8> {
        self.pool.pop().unwrap_or_else(|| Vec::with_capacity(self.buffer_size))
    }

    /// Returns a buffer to the pool for reuse.
    pub fn deallocate(&mut self, mut buffer: Vec<u8>) {
        if self.pool.len() < self.max_pool_size {
            buffer.clear();
            self.pool.push(buffer);
        }
    }

    /// Returns the number of buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

/// A committed datagram waiting to be written by an interface.
#[derive(Debug)]
pub struct OutboundPacket {
    /// Destination.
    pub endpoint: Endpoint,
    /// Datagram bytes.
    pub data: Vec<u8>,
}

/// Bounded multi-producer queue of outbound datagrams backed by pooled slots.
#[derive(Debug)]
pub struct SendQueue {
    pool: Mutex<PacketAllocator>,
    capacity: usize,
    slot_size: usize,
    in_use: AtomicUsize,
    sender: Sender<OutboundPacket>,
    receiver: Receiver<OutboundPacket>,
    #[cfg(feature = "send-leak-check")]
    leaked: AtomicUsize,
}

impl SendQueue {
    /// Creates a queue of `capacity` slots of at most `slot_size` bytes each.
    pub fn new(capacity: usize, slot_size: usize) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            pool: Mutex::new(PacketAllocator::new(slot_size, capacity)),
            capacity,
            slot_size,
            in_use: AtomicUsize::new(0),
            sender,
            receiver,
            #[cfg(feature = "send-leak-check")]
            leaked: AtomicUsize::new(0),
        }
    }

    /// Largest datagram a slot can hold.
    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Slots currently reserved or waiting to be sent.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Committed datagrams waiting for the interface.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Reserves a slot for a datagram of `required_size` bytes.
    pub fn begin_send(&self, endpoint: Endpoint, required_size: usize) -> Result<SendHandle<'_>> {
        if required_size > self.slot_size {
            return Err(StatusCode::PacketOverflow.into());
        }
        if self.in_use.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.in_use.fetch_sub(1, Ordering::AcqRel);
            return Err(StatusCode::SendQueueFull.into());
        }
        let buffer = self.pool.lock().unwrap_or_else(PoisonError::into_inner).allocate();
        Ok(SendHandle { queue: self, endpoint, buffer: Some(buffer) })
    }

    /// Commits a reserved slot. Returns the number of bytes queued.
    pub fn end_send(&self, mut handle: SendHandle<'_>) -> Result<usize> {
        if !std::ptr::eq(handle.queue, self) {
            return Err(StatusCode::SendHandleInvalid.into());
        }
        let data = handle.buffer.take().ok_or(StatusCode::SendHandleInvalid)?;
        let len = data.len();
        if let Err(rejected) = self.sender.send(OutboundPacket { endpoint: handle.endpoint, data }) {
            self.recycle(rejected.into_inner());
            return Err(StatusCode::SendQueueFull.into());
        }
        Ok(len)
    }

    /// Releases a reserved slot without sending it.
    pub fn abort_send(&self, mut handle: SendHandle<'_>) -> Result<()> {
        if !std::ptr::eq(handle.queue, self) {
            return Err(StatusCode::SendHandleInvalid.into());
        }
        if let Some(buffer) = handle.buffer.take() {
            self.release(buffer);
        }
        Ok(())
    }

    /// Reserves, fills and commits a slot in one call.
    pub fn push(&self, endpoint: Endpoint, bytes: &[u8]) -> Result<usize> {
        let mut handle = self.begin_send(endpoint, bytes.len())?;
        handle.write(bytes)?;
        self.end_send(handle)
    }

    /// Drains committed datagrams. Each one must be handed back with [`SendQueue::recycle`].
    pub fn drain(&self) -> TryIter<'_, OutboundPacket> {
        self.receiver.try_iter()
    }

    /// Returns a drained datagram's slot to the pool.
    pub fn recycle(&self, packet: OutboundPacket) {
        self.release(packet.data);
    }

    /// Handles dropped without a matching end or abort since the last call.
    #[cfg(feature = "send-leak-check")]
    pub fn take_leaked_handles(&self) -> usize {
        self.leaked.swap(0, Ordering::AcqRel)
    }

    fn release(&self, buffer: Vec<u8>) {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner).deallocate(buffer);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A reserved outbound slot. Dropping it without committing releases the slot.
#[derive(Debug)]
pub struct SendHandle<'q> {
    queue: &'q SendQueue,
    endpoint: Endpoint,
    buffer: Option<Vec<u8>>,
}

impl SendHandle<'_> {
    /// Destination of the datagram.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Appends bytes to the slot.
    pub fn write(&mut self, bytes: &[u8]) -> std::result::Result<(), StatusCode> {
        let buffer = self.buffer.as_mut().ok_or(StatusCode::SendHandleInvalid)?;
        if buffer.len() + bytes.len() > self.queue.slot_size {
            return Err(StatusCode::PacketOverflow);
        }
        buffer.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::len)
    }

    /// Returns true if nothing was written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SendHandle<'_> {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            #[cfg(feature = "send-leak-check")]
            self.queue.leaked.fetch_add(1, Ordering::AcqRel);
            self.queue.release(buffer);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ReceivedSlot {
    endpoint: Endpoint,
    offset: usize,
    len: usize,
}

/// Flat per-tick buffer of received datagrams.
#[derive(Debug, Default)]
pub struct ReceiveQueue {
    data: Vec<u8>,
    slots: Vec<ReceivedSlot>,
    capacity: usize,
    max_packet_size: usize,
    received: u64,
    dropped: u64,
}

impl ReceiveQueue {
    /// Creates a queue holding up to `capacity` datagrams of `max_packet_size` bytes.
    pub fn new(capacity: usize, max_packet_size: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity * max_packet_size),
            slots: Vec::with_capacity(capacity),
            capacity,
            max_packet_size,
            received: 0,
            dropped: 0,
        }
    }

    /// Largest datagram accepted.
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    /// Returns true if no more datagrams fit this tick.
    pub fn is_full(&self) -> bool {
        self.slots.len() >= self.capacity
    }

    /// Appends a datagram. Returns false and counts a drop if it does not fit.
    pub fn push(&mut self, endpoint: Endpoint, bytes: &[u8]) -> bool {
        if self.is_full() || bytes.len() > self.max_packet_size {
            self.dropped += 1;
            return false;
        }
        let offset = self.data.len();
        self.data.extend_from_slice(bytes);
        self.slots.push(ReceivedSlot { endpoint, offset, len: bytes.len() });
        self.received += 1;
        true
    }

    /// Datagram at `index`.
    pub fn get(&self, index: usize) -> Option<(Endpoint, &[u8])> {
        let slot = self.slots.get(index)?;
        Some((slot.endpoint, &self.data[slot.offset..slot.offset + slot.len]))
    }

    /// Iterates the datagrams in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (Endpoint, &[u8])> + '_ {
        self.slots.iter().map(move |slot| (slot.endpoint, &self.data[slot.offset..slot.offset + slot.len]))
    }

    /// Datagrams held this tick.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if nothing was received this tick.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Rewinds the queue for the next tick. Counters are kept.
    pub fn clear(&mut self) {
        self.data.clear();
        self.slots.clear();
    }

    /// Total datagrams accepted since creation.
    pub fn received_count(&self) -> u64 {
        self.received
    }

    /// Total datagrams dropped for lack of room.
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_end_send_round_trip() {
        let queue = SendQueue::new(4, 64);
        let endpoint = Endpoint::ipc(1);

        let mut handle = queue.begin_send(endpoint, 3).unwrap();
        handle.write(&[1, 2, 3]).unwrap();
        assert_eq!(queue.end_send(handle).unwrap(), 3);
        assert_eq!(queue.pending(), 1);

        let packets: Vec<_> = queue.drain().collect();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![1, 2, 3]);
        assert_eq!(packets[0].endpoint, endpoint);
        for packet in packets {
            queue.recycle(packet);
        }
        assert_eq!(queue.in_use(), 0);
    }

    #[test]
    fn test_queue_full() {
        let queue = SendQueue::new(2, 64);
        let a = queue.begin_send(Endpoint::ipc(1), 1).unwrap();
        let _b = queue.begin_send(Endpoint::ipc(1), 1).unwrap();

        let err = queue.begin_send(Endpoint::ipc(1), 1).unwrap_err();
        assert_eq!(err.status(), StatusCode::SendQueueFull);

        queue.abort_send(a).unwrap();
        assert!(queue.begin_send(Endpoint::ipc(1), 1).is_ok());
    }

    #[test]
    fn test_oversized_reservation() {
        let queue = SendQueue::new(2, 8);
        let err = queue.begin_send(Endpoint::ipc(1), 9).unwrap_err();
        assert_eq!(err.status(), StatusCode::PacketOverflow);

        let mut handle = queue.begin_send(Endpoint::ipc(1), 8).unwrap();
        assert_eq!(handle.write(&[0; 9]), Err(StatusCode::PacketOverflow));
    }

    #[test]
    fn test_handle_from_other_queue_is_invalid() {
        let first = SendQueue::new(2, 8);
        let second = SendQueue::new(2, 8);
        let handle = first.begin_send(Endpoint::ipc(1), 1).unwrap();

        let err = second.end_send(handle).unwrap_err();
        assert_eq!(err.status(), StatusCode::SendHandleInvalid);
        assert_eq!(first.in_use(), 0);
    }

    #[test]
    fn test_dropped_handle_releases_slot() {
        let queue = SendQueue::new(1, 8);
        drop(queue.begin_send(Endpoint::ipc(1), 1).unwrap());
        assert_eq!(queue.in_use(), 0);
        #[cfg(feature = "send-leak-check")]
        assert_eq!(queue.take_leaked_handles(), 1);
    }

    #[test]
    fn test_receive_queue_limits() {
        let mut queue = ReceiveQueue::new(2, 4);
        assert!(queue.push(Endpoint::ipc(1), &[1, 2]));
        assert!(!queue.push(Endpoint::ipc(1), &[0; 5]));
        assert!(queue.push(Endpoint::ipc(2), &[3]));
        assert!(!queue.push(Endpoint::ipc(3), &[4]));

        let received: Vec<_> = queue.iter().map(|(e, d)| (e, d.to_vec())).collect();
        assert_eq!(received, vec![(Endpoint::ipc(1), vec![1, 2]), (Endpoint::ipc(2), vec![3])]);
        assert_eq!(queue.dropped_count(), 2);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.received_count(), 2);
    }

    #[test]
    fn test_allocator_reuses_buffers() {
        let mut allocator = PacketAllocator::new(16, 1);
        let buffer = allocator.allocate();
        allocator.deallocate(buffer);
        assert_eq!(allocator.available(), 1);
        allocator.deallocate(Vec::new());
        assert_eq!(allocator.available(), 1);
    }
}
