//! Owned packet buffer with reserved headroom.
//!
//! Outbound packets are built inside-out: the payload is placed after a
//! reserved region and every layer carves its header out of that region,
//! back to front. Inbound packets go the other way, each layer consuming its
//! header from the front with [`PacketBuffer::advance`].

use crate::error::StatusCode;

/// Bounds-checked byte buffer with a movable start cursor.
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
}

impl PacketBuffer {
    /// Creates an empty buffer with `capacity` bytes preallocated.
    pub fn with_capacity(capacity: usize) -> Self {
        Self { data: vec![0; capacity], start: 0, end: 0 }
    }

    /// Empties the buffer and places the start cursor `headroom` bytes in.
    pub fn reset(&mut self, headroom: usize) {
        if self.data.len() < headroom {
            self.data.resize(headroom, 0);
        }
        self.start = headroom;
        self.end = headroom;
    }

    /// Replaces the contents, keeping the current headroom.
    pub fn set(&mut self, bytes: &[u8]) {
        let end = self.start + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.start..end].copy_from_slice(bytes);
        self.end = end;
    }

    /// Appends bytes after the current contents.
    pub fn extend(&mut self, bytes: &[u8]) {
        let end = self.end + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.end..end].copy_from_slice(bytes);
        self.end = end;
    }

    /// Prepends a header into the reserved headroom.
    pub fn push_header(&mut self, header: &[u8]) -> Result<(), StatusCode> {
        if header.len() > self.start {
            return Err(StatusCode::PacketOverflow);
        }
        let start = self.start - header.len();
        self.data[start..self.start].copy_from_slice(header);
        self.start = start;
        Ok(())
    }

    /// Drops `count` bytes from the front. Returns false if fewer are present.
    pub fn advance(&mut self, count: usize) -> bool {
        if count > self.len() {
            return false;
        }
        self.start += count;
        true
    }

    /// Discards the contents without moving the start cursor.
    pub fn clear(&mut self) {
        self.end = self.start;
    }

    /// Bytes still available in front of the contents.
    pub fn headroom(&self) -> usize {
        self.start
    }

    /// Current contents.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Current contents, mutable.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.start..self.end]
    }

    /// Number of content bytes.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true when there is no content.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}
