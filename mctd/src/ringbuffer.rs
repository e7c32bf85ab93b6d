//! Bounded FIFO of whole messages queued while no client is attached.
//!
//! Capacity is byte-accounted and grows lazily in `step_size` increments up
//! to `max_size`; it never shrinks. A failed push is tail-drop: the caller
//! records it in the daemon overflow counter.

use std::collections::VecDeque;
use thiserror::Error;

/// Per-record bookkeeping charge, mirroring the length word each record
/// carries in the on-wire buffer layout.
const RECORD_OVERHEAD: usize = 4;

#[derive(Debug, Error)]
#[error("ring buffer full ({used}/{size} bytes used)")]
pub struct RingBufferFull {
    pub used: usize,
    pub size: usize,
}

#[derive(Debug)]
pub struct RingBuffer {
    records: VecDeque<Vec<u8>>,
    used: usize,
    size: usize,
    max_size: usize,
    step_size: usize,
}

impl RingBuffer {
    pub fn new(min_size: usize, max_size: usize, step_size: usize) -> Self {
        let max_size = max_size.max(min_size);
        RingBuffer {
            records: VecDeque::new(),
            used: 0,
            size: min_size,
            max_size,
            step_size: step_size.max(1),
        }
    }

    /// Enqueue one record formed from three spans. All-or-nothing.
    pub fn push3(&mut self, d1: &[u8], d2: &[u8], d3: &[u8]) -> Result<(), RingBufferFull> {
        let needed = d1.len() + d2.len() + d3.len() + RECORD_OVERHEAD;

        while self.used + needed > self.size {
            if self.size >= self.max_size {
                return Err(RingBufferFull {
                    used: self.used,
                    size: self.size,
                });
            }
            self.size = (self.size + self.step_size).min(self.max_size);
        }

        let mut record = Vec::with_capacity(needed - RECORD_OVERHEAD);
        record.extend_from_slice(d1);
        record.extend_from_slice(d2);
        record.extend_from_slice(d3);
        self.used += needed;
        self.records.push_back(record);
        Ok(())
    }

    /// Oldest record without removing it.
    pub fn front(&self) -> Option<&[u8]> {
        self.records.front().map(|r| r.as_slice())
    }

    /// Drop the oldest record.
    pub fn remove(&mut self) {
        if let Some(record) = self.records.pop_front() {
            self.used -= record.len() + RECORD_OVERHEAD;
        }
    }

    pub fn message_count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }
}
