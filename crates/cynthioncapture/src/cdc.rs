//! A queue between two independently clocked loops.
//!
//! Each side owns a pointer one bit wider than the slot index and publishes
//! it Gray-coded. The other side only ever sees it through a chain of
//! synchronizer stages clocked by its own ticks, so a stale pointer is always
//! a valid, conservative one: the producer may think the queue fuller than it
//! is, the consumer may think it emptier.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use anyhow::bail;

use crate::Result;
use crate::stream::{ByteStream, StreamByte};

/// Synchronizer stages between the two sides.
pub const SYNC_STAGES: usize = 2;

pub fn gray_encode(value: u32) -> u32 {
    value ^ (value >> 1)
}

pub fn gray_decode(gray: u32) -> u32 {
    let mut value = gray;
    let mut shift = 1;
    while shift < u32::BITS {
        value ^= value >> shift;
        shift <<= 1;
    }
    value
}

/// A chain of registers clocked by the receiving side.
#[derive(Clone, Debug)]
pub struct Synchronizer<const STAGES: usize> {
    stages: [u32; STAGES],
}

impl<const STAGES: usize> Synchronizer<STAGES> {
    pub fn new(reset: u32) -> Self {
        Synchronizer { stages: [reset; STAGES] }
    }

    /// Shift `input` in, returning the new output.
    pub fn clock(&mut self, input: u32) -> u32 {
        self.stages.rotate_right(1);
        self.stages[0] = input;
        self.output()
    }

    pub fn output(&self) -> u32 {
        self.stages[STAGES - 1]
    }
}

/// Why a push was refused.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PushError {
    Full,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub pushed: u64,
    /// Pushes turned away because the queue looked full.
    pub refused: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub popped: u64,
    pub resets: u64,
    /// Bytes dropped by resets.
    pub reset_bytes: u64,
}

struct Shared {
    slots: Box<[AtomicU16]>,
    produce_gray: AtomicU32,
    consume_gray: AtomicU32,
    /// Count of pushed bytes, since creation, up to which the producer has
    /// asked for the data to be dropped.
    discard_mark: AtomicU64,
    closed: AtomicBool,
}

/// Create a queue of `depth` slots, returning its two halves.
pub fn cross_domain_queue(depth: usize) -> Result<(QueueProducer, QueueConsumer)> {
    if depth < 2 || !depth.is_power_of_two() || depth > 1 << 30 {
        bail!("Queue depth must be a power of two between 2 and 2^30, got {depth}");
    }
    let address_bits = depth.trailing_zeros();
    let pointer_mask = (1u32 << (address_bits + 1)) - 1;
    let shared = Arc::new(Shared {
        slots: (0..depth).map(|_| AtomicU16::new(0)).collect(),
        produce_gray: AtomicU32::new(0),
        consume_gray: AtomicU32::new(0),
        discard_mark: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    let producer = QueueProducer {
        shared: shared.clone(),
        address_bits,
        pointer_mask,
        produce: 0,
        consume_sync: Synchronizer::new(0),
        refusing: false,
        stats: ProducerStats::default(),
    };
    let consumer = QueueConsumer {
        shared,
        pointer_mask,
        consume: 0,
        produce_sync: Synchronizer::new(0),
        closed_seen: 0,
        stats: ConsumerStats::default(),
    };
    Ok((producer, consumer))
}

pub struct QueueProducer {
    shared: Arc<Shared>,
    address_bits: u32,
    pointer_mask: u32,
    produce: u32,
    consume_sync: Synchronizer<SYNC_STAGES>,
    refusing: bool,
    stats: ProducerStats,
}

impl QueueProducer {
    /// Advance one producer tick.
    pub fn tick(&mut self) {
        self.consume_sync.clock(self.shared.consume_gray.load(Ordering::Acquire));
    }

    pub fn is_full(&self) -> bool {
        // Full when the pointers differ in their top two bits only.
        let top_bits = 0b11 << (self.address_bits - 1);
        gray_encode(self.produce) ^ self.consume_sync.output() == top_bits
    }

    /// Slots in use, as seen from this side.
    pub fn level(&self) -> usize {
        let consume = gray_decode(self.consume_sync.output());
        (self.produce.wrapping_sub(consume) & self.pointer_mask) as usize
    }

    pub fn try_push(&mut self, byte: StreamByte) -> std::result::Result<(), PushError> {
        if self.is_full() {
            if !self.refusing {
                tracing::warn!(level = self.level(), "Queue full, holding back data");
                self.refusing = true;
            }
            self.stats.refused += 1;
            return Err(PushError::Full);
        }
        self.refusing = false;
        let index = (self.produce & ((1 << self.address_bits) - 1)) as usize;
        self.shared.slots[index].store(byte.to_word(), Ordering::Relaxed);
        self.produce = (self.produce + 1) & self.pointer_mask;
        self.shared.produce_gray.store(gray_encode(self.produce), Ordering::Release);
        self.stats.pushed += 1;
        Ok(())
    }

    /// Ask the consumer to drop everything pushed so far, and the next
    /// `following` bytes.
    ///
    /// The mark is published before any later push, so a consumer that
    /// sees those bytes sees the request too.
    pub fn request_discard(&mut self, following: usize) {
        let mark = self.stats.pushed + following as u64;
        self.shared.discard_mark.fetch_max(mark, Ordering::Release);
    }

    pub fn stats(&self) -> &ProducerStats {
        &self.stats
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

pub struct QueueConsumer {
    shared: Arc<Shared>,
    pointer_mask: u32,
    consume: u32,
    produce_sync: Synchronizer<SYNC_STAGES>,
    /// Ticks since the producer was seen to have gone away.
    closed_seen: usize,
    stats: ConsumerStats,
}

impl QueueConsumer {
    /// Advance one consumer tick.
    pub fn tick(&mut self) {
        if self.shared.closed.load(Ordering::Acquire) {
            self.closed_seen = (self.closed_seen + 1).min(SYNC_STAGES + 1);
        }
        self.produce_sync.clock(self.shared.produce_gray.load(Ordering::Acquire));
    }

    pub fn is_empty(&self) -> bool {
        gray_encode(self.consume) == self.produce_sync.output()
    }

    /// Slots in use, as seen from this side.
    pub fn level(&self) -> usize {
        let produce = gray_decode(self.produce_sync.output());
        (produce.wrapping_sub(self.consume) & self.pointer_mask) as usize
    }

    /// The producer is gone and everything it pushed has been consumed.
    pub fn is_finished(&self) -> bool {
        // The final pointer has passed through the synchronizer once the
        // close has been seen for more ticks than there are stages.
        self.closed_seen > SYNC_STAGES && self.is_empty()
    }

    /// Drop everything visible and resynchronize to the producer, returning
    /// the number of bytes dropped.
    ///
    /// The consumer pointer is taken from the synchronized producer pointer,
    /// so it is always one the producer has actually published.
    pub fn reset(&mut self) -> usize {
        let dropped = self.level();
        let produce_gray = self.produce_sync.output();
        self.consume = gray_decode(produce_gray) & self.pointer_mask;
        self.shared.consume_gray.store(produce_gray, Ordering::Release);
        self.stats.resets += 1;
        self.stats.reset_bytes += dropped as u64;
        dropped
    }

    /// The latest discard request; see [`QueueProducer::request_discard`].
    pub fn discard_mark(&self) -> u64 {
        self.shared.discard_mark.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }
}

impl ByteStream for QueueConsumer {
    fn peek(&self) -> Option<StreamByte> {
        if self.is_empty() {
            return None;
        }
        let index = (self.consume as usize) & (self.shared.slots.len() - 1);
        Some(StreamByte::from_word(self.shared.slots[index].load(Ordering::Relaxed)))
    }

    fn accept(&mut self) -> Option<StreamByte> {
        let byte = self.peek()?;
        self.consume = (self.consume + 1) & self.pointer_mask;
        self.shared.consume_gray.store(gray_encode(self.consume), Ordering::Release);
        self.stats.popped += 1;
        Some(byte)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;

    /// xorshift64, deterministic across runs.
    struct Rng(u64);

    impl Rng {
        fn next_u64(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn chance(&mut self, percent: u64) -> bool {
            self.next_u64() % 100 < percent
        }
    }

    fn byte(n: usize) -> StreamByte {
        StreamByte::new(n as u8, n % 7 == 0)
    }

    #[test]
    fn gray_code() {
        for value in 0..1024u32 {
            let gray = gray_encode(value);
            assert_eq!(gray_decode(gray), value);
            // Neighbouring values differ in exactly one bit.
            assert_eq!((gray ^ gray_encode(value + 1)).count_ones(), 1);
        }
    }

    #[test]
    fn pointer_moves_after_synchronizer_delay() {
        let (mut producer, mut consumer) = cross_domain_queue(4).unwrap();
        producer.try_push(byte(1)).unwrap();
        consumer.tick();
        assert!(consumer.is_empty());
        consumer.tick();
        assert_eq!(consumer.accept(), Some(byte(1)));
        assert!(consumer.is_empty());
    }

    #[test]
    fn full_until_consumer_progress_is_seen() {
        let (mut producer, mut consumer) = cross_domain_queue(4).unwrap();
        for n in 0..4 {
            producer.try_push(byte(n)).unwrap();
        }
        assert!(producer.is_full());
        assert_eq!(producer.try_push(byte(4)), Err(PushError::Full));
        assert_eq!(producer.stats().refused, 1);

        for _ in 0..SYNC_STAGES {
            consumer.tick();
        }
        assert_eq!(consumer.level(), 4);
        consumer.accept();
        producer.tick();
        assert!(producer.is_full());
        producer.tick();
        assert!(!producer.is_full());
        producer.try_push(byte(4)).unwrap();
    }

    #[test]
    fn reset_resynchronizes_to_producer() {
        let (mut producer, mut consumer) = cross_domain_queue(8).unwrap();
        for n in 0..5 {
            producer.try_push(byte(n)).unwrap();
        }
        consumer.tick();
        consumer.tick();
        consumer.accept();
        assert_eq!(consumer.reset(), 4);
        assert!(consumer.is_empty());
        assert_eq!(consumer.stats().reset_bytes, 4);
        assert_eq!(consumer.level(), 0);

        producer.tick();
        producer.tick();
        assert_eq!(producer.level(), 0);
        producer.try_push(byte(9)).unwrap();
        consumer.tick();
        consumer.tick();
        assert_eq!(consumer.accept(), Some(byte(9)));
    }

    #[test]
    fn discard_mark_counts_from_creation() {
        let (mut producer, consumer) = cross_domain_queue(4).unwrap();
        assert_eq!(consumer.discard_mark(), 0);
        for n in 0..3 {
            producer.try_push(byte(n)).unwrap();
        }
        producer.request_discard(2);
        assert_eq!(consumer.discard_mark(), 5);
        // Never moves backwards.
        producer.request_discard(0);
        assert_eq!(consumer.discard_mark(), 5);
    }

    #[test]
    fn randomized_against_model() {
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        let (mut producer, mut consumer) = cross_domain_queue(8).unwrap();
        let mut model = VecDeque::new();
        let mut next = 0usize;

        for _ in 0..20_000 {
            if rng.chance(50) {
                producer.tick();
                // The producer's view can lag, but only towards fuller.
                assert!(producer.level() >= model.len());
                if producer.is_full() {
                    assert_eq!(producer.level(), 8);
                }
                if producer.try_push(byte(next)).is_ok() {
                    model.push_back(byte(next));
                    next += 1;
                }
                assert!(model.len() <= 8);
            }
            if rng.chance(50) {
                consumer.tick();
                assert!(consumer.level() <= model.len());
                if rng.chance(80) {
                    if let Some(got) = consumer.accept() {
                        assert_eq!(Some(got), model.pop_front());
                    }
                }
            }
        }
    }

    #[test]
    fn threads_preserve_order() {
        const COUNT: usize = 100_000;
        let (mut producer, mut consumer) = cross_domain_queue(16).unwrap();
        let writer = std::thread::spawn(move || {
            let mut n = 0;
            while n < COUNT {
                producer.tick();
                if producer.try_push(byte(n)).is_ok() {
                    n += 1;
                }
            }
        });
        let mut received = 0;
        while !consumer.is_finished() {
            consumer.tick();
            if let Some(got) = consumer.accept() {
                assert_eq!(got, byte(received));
                received += 1;
            }
        }
        writer.join().unwrap();
        assert_eq!(received, COUNT);
    }
}
