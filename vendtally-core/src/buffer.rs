//! Fixed-capacity ring buffer of recent dispense events
//!
//! The buffer is sized once and never grows. When it is full, appending a new
//! event evicts the oldest one. It only holds the most recent `capacity`
//! events; the all-time count lives on the counter.

use crate::error::{Error, Result};
use crate::types::Event;

/// Circular event store with explicit head/tail/count bookkeeping
#[derive(Debug)]
pub struct RingBuffer {
    slots: Vec<Event>,
    /// Next slot to write
    head: usize,
    /// Oldest live slot
    tail: usize,
    count: usize,
}

impl RingBuffer {
    /// Allocate a buffer holding up to `capacity` events
    ///
    /// Returns [`Error::MemoryError`] if the storage cannot be reserved.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidConfig(
                "ring buffer capacity must be nonzero".to_string(),
            ));
        }

        let mut slots = Vec::new();
        slots.try_reserve_exact(capacity).map_err(|e| {
            Error::MemoryError(format!("failed to allocate {} event slots: {}", capacity, e))
        })?;
        slots.resize(capacity, Event::default());

        Ok(Self {
            slots,
            head: 0,
            tail: 0,
            count: 0,
        })
    }

    /// Append an event, evicting the oldest one when full
    pub fn append(&mut self, event: Event) {
        let capacity = self.capacity();

        if self.count == capacity {
            self.tail = (self.tail + 1) % capacity;
            self.count -= 1;
        }

        self.slots[self.head] = event;
        self.head = (self.head + 1) % capacity;
        self.count += 1;
    }

    /// Number of live events
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Maximum number of live events
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate live events from oldest to newest
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            buffer: self,
            index: self.tail,
            remaining: self.count,
        }
    }
}

/// Oldest-to-newest iterator over a [`RingBuffer`]
pub struct Iter<'a> {
    buffer: &'a RingBuffer,
    index: usize,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Event;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let event = &self.buffer.slots[self.index];
        self.index = (self.index + 1) % self.buffer.capacity();
        self.remaining -= 1;
        Some(event)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a RingBuffer {
    type Item = &'a Event;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
