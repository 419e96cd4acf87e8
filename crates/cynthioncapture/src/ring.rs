//! Byte ring buffer with uncommitted (pending) writes.

use std::collections::VecDeque;

use anyhow::bail;

use crate::Result;
use crate::stream::{ByteStream, StreamByte};

/// Fixed-capacity ring holding committed records and at most one record
/// still being written.
///
/// Pending bytes are invisible to the reader until committed, and can be
/// abandoned as a whole.
pub struct RingBuffer {
    storage: Box<[u8]>,
    mask: usize,
    write: usize,
    read: usize,
    count: usize,
    pending: usize,
    /// Unread bytes of each committed record.
    records: VecDeque<usize>,
    /// The reader is part way through the front record.
    front_started: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Result<RingBuffer> {
        if !capacity.is_power_of_two() {
            bail!("Ring capacity must be a power of two, got {capacity}");
        }
        Ok(RingBuffer {
            storage: vec![0; capacity].into_boxed_slice(),
            mask: capacity - 1,
            write: 0,
            read: 0,
            count: 0,
            pending: 0,
            records: VecDeque::new(),
            front_started: false,
        })
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Committed bytes awaiting the reader.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Whether `extra` more bytes fit alongside everything already held.
    pub fn fits(&self, extra: usize) -> bool {
        self.count + self.pending + extra <= self.capacity()
    }

    /// Position of the next pending byte.
    pub fn cursor(&self) -> usize {
        self.write
    }

    pub fn push_pending(&mut self, byte: u8) {
        debug_assert!(self.fits(1));
        self.storage[self.write] = byte;
        self.write = (self.write + 1) & self.mask;
        self.pending += 1;
    }

    /// Overwrite already-pending bytes starting at `position`.
    pub fn fill_pending(&mut self, position: usize, bytes: &[u8]) {
        for (offset, &byte) in bytes.iter().enumerate() {
            self.storage[(position + offset) & self.mask] = byte;
        }
    }

    /// Make the pending bytes visible to the reader as one record.
    pub fn commit(&mut self) {
        if self.pending == 0 {
            return;
        }
        self.count += self.pending;
        self.records.push_back(self.pending);
        self.pending = 0;
    }

    /// Roll the write cursor back over any pending bytes.
    pub fn abandon(&mut self) {
        self.write = self.write.wrapping_sub(self.pending) & self.mask;
        self.pending = 0;
    }

    /// Append and commit a complete record.
    pub fn push_record(&mut self, bytes: &[u8]) {
        debug_assert_eq!(self.pending, 0);
        for &byte in bytes {
            self.push_pending(byte);
        }
        self.commit();
    }

    /// Unread bytes of the front record, if the reader has started on it.
    pub fn in_flight(&self) -> usize {
        match self.records.front() {
            Some(&remaining) if self.front_started => remaining,
            _ => 0,
        }
    }

    /// Drop everything, committed or not, except the rest of a record the
    /// reader has already started on.
    pub fn discard(&mut self) {
        let in_flight = self.in_flight();
        self.records.clear();
        self.pending = 0;
        self.count = in_flight;
        if in_flight > 0 {
            self.records.push_back(in_flight);
            self.write = (self.read + in_flight) & self.mask;
        } else {
            self.write = 0;
            self.read = 0;
        }
    }
}

impl ByteStream for RingBuffer {
    fn peek(&self) -> Option<StreamByte> {
        let remaining = *self.records.front()?;
        Some(StreamByte::new(self.storage[self.read], remaining == 1))
    }

    fn accept(&mut self) -> Option<StreamByte> {
        let byte = self.peek()?;
        self.read = (self.read + 1) & self.mask;
        self.count -= 1;
        if let Some(remaining) = self.records.front_mut() {
            *remaining -= 1;
            self.front_started = *remaining > 0;
            if *remaining == 0 {
                self.records.pop_front();
            }
        }
        Some(byte)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(ring: &mut RingBuffer) -> Vec<StreamByte> {
        std::iter::from_fn(|| ring.accept()).collect()
    }

    #[test]
    fn pending_bytes_are_hidden_until_commit() {
        let mut ring = RingBuffer::new(8).unwrap();
        ring.push_pending(1);
        ring.push_pending(2);
        assert_eq!(ring.peek(), None);
        ring.commit();
        assert_eq!(drain(&mut ring), vec![StreamByte::new(1, false), StreamByte::new(2, true)]);
        assert!(ring.is_empty());
    }

    #[test]
    fn abandon_rewinds_across_wrap() {
        let mut ring = RingBuffer::new(4).unwrap();
        ring.push_record(&[1, 2, 3]);
        assert_eq!(drain(&mut ring).len(), 3);
        ring.push_pending(4);
        ring.push_pending(5);
        ring.abandon();
        ring.push_record(&[6]);
        assert_eq!(drain(&mut ring), vec![StreamByte::new(6, true)]);
    }

    #[test]
    fn fill_pending_wraps() {
        let mut ring = RingBuffer::new(4).unwrap();
        ring.push_record(&[0, 0, 0]);
        drain(&mut ring);
        let slot = ring.cursor();
        ring.push_pending(0);
        ring.push_pending(0);
        ring.fill_pending(slot, &[7, 8]);
        ring.commit();
        let bytes: Vec<u8> = drain(&mut ring).iter().map(|b| b.payload).collect();
        assert_eq!(bytes, vec![7, 8]);
    }

    #[test]
    fn discard_keeps_record_being_read() {
        let mut ring = RingBuffer::new(16).unwrap();
        ring.push_record(&[1, 2, 3]);
        ring.push_record(&[4, 5]);
        ring.accept();
        ring.push_pending(6);
        ring.discard();
        assert_eq!(drain(&mut ring), vec![StreamByte::new(2, false), StreamByte::new(3, true)]);

        ring.push_record(&[7, 8]);
        ring.discard();
        assert!(ring.is_empty());
        assert_eq!(ring.peek(), None);
    }

    #[test]
    fn capacity_must_be_power_of_two() {
        assert!(RingBuffer::new(12).is_err());
        assert!(RingBuffer::new(0).is_err());
    }
}
