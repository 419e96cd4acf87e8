//! Large overflow buffer in burst-access memory.

use std::collections::VecDeque;

use anyhow::bail;

use crate::Result;
use crate::stream::{ByteStream, StreamByte};

/// Memory accessed in bursts of consecutive words.
///
/// A transfer is started while the memory is idle; after some latency one
/// word moves per cycle while `data_ready`, until a word is flagged final.
pub trait BurstMemory {
    /// Capacity in words.
    fn depth(&self) -> usize;

    fn idle(&self) -> bool;

    fn start_transfer(&mut self, address: usize, write: bool);

    /// A word can move on this cycle.
    fn data_ready(&self) -> bool;

    fn write_word(&mut self, word: u16, last: bool);

    fn read_word(&mut self, last: bool) -> u16;

    /// Advance one cycle.
    fn tick(&mut self);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Command { remaining: u32 },
    Data,
    Recovery { remaining: u32 },
}

/// Model of a HyperRAM part: fixed access latency and a recovery time
/// between transactions.
pub struct HyperRam {
    cells: Vec<u16>,
    latency: u32,
    recovery: u32,
    phase: Phase,
    address: usize,
}

impl HyperRam {
    pub fn new(depth: usize, latency: u32, recovery: u32) -> HyperRam {
        HyperRam {
            cells: vec![0; depth],
            latency,
            recovery,
            phase: Phase::Idle,
            address: 0,
        }
    }

    fn advance_address(&mut self, last: bool) {
        self.address = (self.address + 1) % self.cells.len();
        if last {
            self.phase = match self.recovery {
                0 => Phase::Idle,
                remaining => Phase::Recovery { remaining },
            };
        }
    }
}

impl BurstMemory for HyperRam {
    fn depth(&self) -> usize {
        self.cells.len()
    }

    fn idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    fn start_transfer(&mut self, address: usize, _write: bool) {
        debug_assert!(self.idle());
        self.address = address % self.cells.len();
        self.phase = match self.latency {
            0 => Phase::Data,
            remaining => Phase::Command { remaining },
        };
    }

    fn data_ready(&self) -> bool {
        self.phase == Phase::Data
    }

    fn write_word(&mut self, word: u16, last: bool) {
        self.cells[self.address] = word;
        self.advance_address(last);
    }

    fn read_word(&mut self, last: bool) -> u16 {
        let word = self.cells[self.address];
        self.advance_address(last);
        word
    }

    fn tick(&mut self) {
        self.phase = match self.phase {
            Phase::Command { remaining: 1 } => Phase::Data,
            Phase::Command { remaining } => Phase::Command { remaining: remaining - 1 },
            Phase::Recovery { remaining: 1 } => Phase::Idle,
            Phase::Recovery { remaining } => Phase::Recovery { remaining: remaining - 1 },
            phase => phase,
        };
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub write_bursts: u64,
    pub read_bursts: u64,
    pub words_written: u64,
    pub words_read: u64,
    pub peak_level: usize,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum StoreState {
    Idle,
    Busy { write: bool },
}

/// A FIFO over burst memory, with a small output buffer in front of the
/// reader.
pub struct OverflowBackingStore<M> {
    memory: M,
    state: StoreState,
    write_address: usize,
    read_address: usize,
    level: usize,
    output: VecDeque<StreamByte>,
    output_depth: usize,
    read_threshold: usize,
    stats: StoreStats,
}

impl<M: BurstMemory> OverflowBackingStore<M> {
    /// Wrap `memory`. The output buffer holds at least two words; reads are
    /// started when it holds fewer than `read_threshold` (by default, half
    /// of it).
    pub fn new(
        memory: M,
        output_depth: usize,
        read_threshold: Option<usize>,
    ) -> Result<OverflowBackingStore<M>> {
        if memory.depth() < 2 {
            bail!("Backing memory must hold at least two words");
        }
        let output_depth = output_depth.max(2);
        let read_threshold = read_threshold.unwrap_or(output_depth / 2);
        if read_threshold == 0 || read_threshold >= output_depth {
            bail!("Read threshold {read_threshold} must be between 1 and {}", output_depth - 1);
        }
        Ok(OverflowBackingStore {
            memory,
            state: StoreState::Idle,
            write_address: 0,
            read_address: 0,
            level: 0,
            output: VecDeque::with_capacity(output_depth),
            output_depth,
            read_threshold,
            stats: StoreStats::default(),
        })
    }

    /// Words held in memory, not counting the output buffer.
    pub fn level(&self) -> usize {
        self.level
    }

    pub fn is_empty(&self) -> bool {
        self.level == 0 && self.output.is_empty() && self.state == StoreState::Idle
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn depth(&self) -> usize {
        self.memory.depth()
    }

    /// Advance one cycle, taking data from `input` as bursts allow.
    pub fn tick(&mut self, input: &mut impl ByteStream) {
        match self.state {
            StoreState::Idle => {
                if input.peek().is_some() && self.level < self.depth() {
                    self.memory.start_transfer(self.write_address, true);
                    self.state = StoreState::Busy { write: true };
                    self.stats.write_bursts += 1;
                } else if self.level > 0 && self.output.len() < self.read_threshold {
                    self.memory.start_transfer(self.read_address, false);
                    self.state = StoreState::Busy { write: false };
                    self.stats.read_bursts += 1;
                }
            }
            StoreState::Busy { write: true } => {
                if self.memory.data_ready() {
                    match input.accept() {
                        Some(byte) => {
                            let last = self.level + 1 == self.depth()
                                || byte.last
                                || input.peek().is_none();
                            self.memory.write_word(byte.to_word(), last);
                            self.write_address = (self.write_address + 1) % self.depth();
                            self.level += 1;
                            self.stats.words_written += 1;
                            self.stats.peak_level = self.stats.peak_level.max(self.level);
                        }
                        // The input was reset under us; end the burst unused.
                        None => self.memory.write_word(0, true),
                    }
                }
            }
            StoreState::Busy { write: false } => {
                if self.memory.data_ready() {
                    let last = self.level <= 1 || self.output.len() + 1 == self.output_depth;
                    let word = self.memory.read_word(last);
                    // Nothing left if the store was cleared mid-burst.
                    if self.level > 0 {
                        self.output.push_back(StreamByte::from_word(word));
                        self.read_address = (self.read_address + 1) % self.depth();
                        self.level -= 1;
                        self.stats.words_read += 1;
                    }
                }
            }
        }
        self.memory.tick();
        if self.memory.idle() {
            self.state = StoreState::Idle;
        }
    }

    /// Words held in memory and in the output buffer.
    pub fn held(&self) -> usize {
        self.level + self.output.len()
    }

    /// Drop everything held, returning how many words that was.
    pub fn clear(&mut self) -> usize {
        let dropped = self.held();
        self.output.clear();
        self.level = 0;
        self.read_address = self.write_address;
        dropped
    }
}

impl<M> ByteStream for OverflowBackingStore<M> {
    fn peek(&self) -> Option<StreamByte> {
        self.output.front().copied()
    }

    fn accept(&mut self) -> Option<StreamByte> {
        self.output.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingBuffer;

    fn source(bytes: &[u8]) -> RingBuffer {
        let mut ring = RingBuffer::new(64).unwrap();
        ring.push_record(bytes);
        ring
    }

    #[test]
    fn hyperram_latency() {
        let mut ram = HyperRam::new(8, 3, 1);
        ram.start_transfer(6, true);
        for _ in 0..3 {
            assert!(!ram.data_ready());
            ram.tick();
        }
        assert!(ram.data_ready());
        ram.write_word(1, false);
        ram.tick();
        ram.write_word(2, true);
        assert!(!ram.idle());
        ram.tick();
        assert!(ram.idle());
        ram.start_transfer(6, false);
        ram.tick();
        ram.tick();
        ram.tick();
        assert_eq!(ram.read_word(false), 1);
        assert_eq!(ram.read_word(true), 2);
    }

    #[test]
    fn passes_bytes_through_in_order() {
        let mut store = OverflowBackingStore::new(HyperRam::new(32, 4, 2), 4, None).unwrap();
        let mut input = source(&[1, 2, 3, 4, 5]);
        let mut output = Vec::new();
        for _ in 0..100 {
            store.tick(&mut input);
            output.extend(store.accept());
        }
        let payloads: Vec<u8> = output.iter().map(|byte| byte.payload).collect();
        assert_eq!(payloads, vec![1, 2, 3, 4, 5]);
        assert!(output[4].last);
        assert!(store.is_empty());
    }

    #[test]
    fn absorbs_data_while_reader_stalls() {
        let mut store = OverflowBackingStore::new(HyperRam::new(64, 2, 0), 2, None).unwrap();
        let bytes: Vec<u8> = (0..40).collect();
        let mut input = source(&bytes);
        for _ in 0..200 {
            store.tick(&mut input);
        }
        assert!(input.is_empty());
        assert_eq!(store.level() + 2, 40);

        let mut output = Vec::new();
        for _ in 0..400 {
            store.tick(&mut input);
            output.extend(store.accept().map(|byte| byte.payload));
        }
        assert_eq!(output, bytes);
    }

    #[test]
    fn output_depth_is_clamped() {
        let store = OverflowBackingStore::new(HyperRam::new(8, 1, 0), 1, None).unwrap();
        assert_eq!(store.output_depth, 2);
        assert!(OverflowBackingStore::new(HyperRam::new(8, 1, 0), 4, Some(4)).is_err());
    }
}
