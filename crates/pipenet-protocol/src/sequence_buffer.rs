//! Wrapping 16-bit sequence numbers and a ring buffer keyed by them.

/// 16-bit wrapping sequence number.
pub type SequenceNumber = u16;

/// Compares sequence numbers with wrapping arithmetic.
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// Compares sequence numbers with wrapping arithmetic.
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

/// Forward distance from `from` to `to`, wrapping.
pub fn sequence_distance(from: u16, to: u16) -> u16 {
    to.wrapping_sub(from)
}

/// Fixed-capacity ring of entries addressed by sequence number.
///
/// Slot `sequence % capacity` holds at most one entry, tagged with the
/// sequence that wrote it, so a lookup for an older or newer sequence mapping
/// to the same slot misses instead of returning the wrong entry. Capacity is
/// rounded up to a power of two so slots stay contiguous across the wrap from
/// 65535 to 0.
#[derive(Debug, Clone)]
pub struct SequenceBuffer<T> {
    entry_sequences: Box<[Option<SequenceNumber>]>,
    entries: Box<[Option<T>]>,
}

impl<T> SequenceBuffer<T> {
    /// Creates a new sequence buffer holding at least `size` entries.
    pub fn with_capacity(size: u16) -> Self {
        let size = size.max(1).next_power_of_two() as usize;
        Self {
            entry_sequences: vec![None; size].into_boxed_slice(),
            entries: std::iter::repeat_with(|| None).take(size).collect(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Stores an entry, replacing whatever occupied its slot.
    pub fn insert(&mut self, sequence_num: SequenceNumber, entry: T) -> Option<T> {
        let index = self.index(sequence_num);
        self.entry_sequences[index] = Some(sequence_num);
        self.entries[index].replace(entry)
    }

    /// Checks if an entry exists at the given sequence number.
    pub fn exists(&self, sequence_num: SequenceNumber) -> bool {
        self.entry_sequences[self.index(sequence_num)] == Some(sequence_num)
    }

    /// Returns true if the slot for `sequence_num` holds any entry.
    pub fn slot_occupied(&self, sequence_num: SequenceNumber) -> bool {
        self.entry_sequences[self.index(sequence_num)].is_some()
    }

    /// Gets an entry by sequence number.
    pub fn get(&self, sequence_num: SequenceNumber) -> Option<&T> {
        if !self.exists(sequence_num) {
            return None;
        }
        self.entries[self.index(sequence_num)].as_ref()
    }

    /// Gets a mutable reference to an entry by sequence number.
    pub fn get_mut(&mut self, sequence_num: SequenceNumber) -> Option<&mut T> {
        if !self.exists(sequence_num) {
            return None;
        }
        let index = self.index(sequence_num);
        self.entries[index].as_mut()
    }

    /// Removes and returns the entry at the specified sequence number.
    pub fn remove(&mut self, sequence_num: SequenceNumber) -> Option<T> {
        if !self.exists(sequence_num) {
            return None;
        }
        let index = self.index(sequence_num);
        self.entry_sequences[index] = None;
        self.entries[index].take()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.entry_sequences.iter().filter(|s| s.is_some()).count()
    }

    /// Returns true if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.entry_sequences.iter().all(Option::is_none)
    }

    /// Iterates occupied entries with their sequence numbers, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (SequenceNumber, &T)> {
        self.entry_sequences
            .iter()
            .zip(self.entries.iter())
            .filter_map(|(sequence, entry)| Some(((*sequence)?, entry.as_ref()?)))
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entry_sequences.iter_mut().for_each(|s| *s = None);
        self.entries.iter_mut().for_each(|e| *e = None);
    }

    fn index(&self, sequence: SequenceNumber) -> usize {
        sequence as usize % self.entries.len()
    }
}
