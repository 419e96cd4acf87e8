//! The producer and consumer loops, and a lock-step analyzer running both.

use std::sync::Arc;

use tracing::{debug, info};

use crate::Result;
use crate::backing::{HyperRam, OverflowBackingStore, StoreStats};
use crate::capture::{CaptureStats, Settings};
use crate::cdc::{ConsumerStats, ProducerStats, QueueConsumer, QueueProducer, cross_domain_queue};
use crate::classifier::BusEventClassifier;
use crate::control::{ControlRegisters, State};
use crate::engine::{EngineStats, PacketCaptureEngine, Status};
use crate::frame::Frame;
use crate::sample::Sample;
use crate::stream::{ByteStream, StreamByte};

/// Runs in the sample clock domain: classifies the bus, captures packets and
/// feeds the queue.
pub struct ProducerLoop {
    classifier: BusEventClassifier,
    engine: PacketCaptureEngine,
    queue: QueueProducer,
    control: Arc<ControlRegisters>,
    applied: Option<State>,
    status: Status,
    ticks: u64,
}

impl ProducerLoop {
    pub fn new(
        settings: &Settings,
        control: Arc<ControlRegisters>,
        queue: QueueProducer,
    ) -> Result<ProducerLoop> {
        Ok(ProducerLoop {
            classifier: BusEventClassifier::new(settings.timings, control.state().speed()),
            engine: PacketCaptureEngine::new(settings.ring_capacity, settings.capture_events)?,
            queue,
            applied: None,
            control,
            status: Status::default(),
            ticks: 0,
        })
    }

    /// Pick up changes to the state register.
    fn apply_control(&mut self) {
        let state = self.control.state();
        if self.applied == Some(state) {
            return;
        }
        if self.applied.map(|applied| applied.speed()) != Some(state.speed()) {
            self.classifier.reconfigure(state.speed());
            self.engine.set_speed(state.speed());
        }
        self.engine.set_enable(state.enable());
        self.applied = Some(state);
    }

    /// Advance one sample clock tick.
    pub fn tick(&mut self, sample: &Sample) -> Status {
        self.apply_control();
        self.queue.tick();
        let event = self.classifier.step(sample);
        let status = self.engine.tick(sample, event);
        if status.discarding {
            // The consumer drops what the discarded capture handed over.
            self.queue.request_discard(self.engine.retained());
        }

        // One byte per tick crosses over; a refused byte stays in the ring.
        if let Some(byte) = self.engine.peek() {
            if self.queue.try_push(byte).is_ok() {
                self.engine.accept();
            }
        }

        self.status = status;
        self.ticks += 1;
        status
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn classifier(&self) -> &BusEventClassifier {
        &self.classifier
    }

    pub fn engine(&self) -> &PacketCaptureEngine {
        &self.engine
    }

    /// Have the consumer drop everything handed over so far, through the
    /// end of the record being handed over.
    pub fn discard_handed_over(&mut self) {
        self.queue.request_discard(self.engine.ring().in_flight());
    }

    /// Nothing is left to hand over to the consumer.
    pub fn is_drained(&self) -> bool {
        self.engine.ring().is_empty()
    }

    /// Queue occupancy as seen by this side.
    pub fn queue_level(&self) -> usize {
        self.queue.level()
    }

    pub fn engine_stats(&self) -> &EngineStats {
        self.engine.stats()
    }

    pub fn queue_stats(&self) -> &ProducerStats {
        self.queue.stats()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// Runs in the report clock domain: drains the queue, through the backing
/// store if one is configured.
pub struct ConsumerLoop {
    queue: QueueConsumer,
    store: Option<OverflowBackingStore<HyperRam>>,
    /// Bytes passed to the reader or dropped, counted in push order.
    position: u64,
    /// Bytes before this position belong to a discarded capture.
    stale_until: u64,
    /// The reader has taken part of a record.
    mid_record: bool,
    discarded: u64,
}

impl ConsumerLoop {
    pub fn new(settings: &Settings, queue: QueueConsumer) -> Result<ConsumerLoop> {
        let store = match &settings.backing_store {
            Some(store) => Some(OverflowBackingStore::new(
                HyperRam::new(store.words, store.latency, store.recovery),
                store.output_depth,
                store.read_threshold,
            )?),
            None => None,
        };
        Ok(ConsumerLoop {
            queue,
            store,
            position: 0,
            stale_until: 0,
            mid_record: false,
            discarded: 0,
        })
    }

    /// Advance one tick; `ready` is whether the reader takes a byte.
    ///
    /// Data of a discarded capture is dropped whether or not the reader is
    /// ready, except for the rest of a record the reader has started on.
    pub fn tick(&mut self, ready: bool) -> Option<StreamByte> {
        self.queue.tick();
        let mark = self.queue.discard_mark();
        if mark > self.stale_until {
            debug!(mark, position = self.position, "Dropping discarded capture data");
            self.stale_until = mark;
        }
        if self.dropping() {
            self.drop_visible();
        }

        let dropping = self.dropping();
        let byte = self.pull(ready || dropping)?;
        self.position += 1;
        if dropping {
            self.discarded += 1;
            return None;
        }
        self.mid_record = !byte.last;
        Some(byte)
    }

    fn dropping(&self) -> bool {
        self.position < self.stale_until && !self.mid_record
    }

    /// Clear the store and reset the queue if all they hold is stale.
    fn drop_visible(&mut self) {
        let stored = self.store.as_ref().map_or(0, |store| store.held());
        let held = (stored + self.queue.level()) as u64;
        if held == 0 || held > self.stale_until - self.position {
            return;
        }
        let mut dropped = 0;
        if let Some(store) = &mut self.store {
            dropped += store.clear();
        }
        if self.queue.level() > 0 {
            dropped += self.queue.reset();
        }
        self.position += dropped as u64;
        self.discarded += dropped as u64;
    }

    fn pull(&mut self, take: bool) -> Option<StreamByte> {
        match &mut self.store {
            Some(store) => {
                store.tick(&mut self.queue);
                if take { store.accept() } else { None }
            }
            None => {
                if take { self.queue.accept() } else { None }
            }
        }
    }

    fn store_empty(&self) -> bool {
        self.store.as_ref().is_none_or(|store| store.is_empty())
    }

    /// Everything visible has been read.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && self.store_empty()
    }

    /// The producer has gone and everything it sent has been read.
    pub fn is_finished(&self) -> bool {
        self.queue.is_finished() && self.store_empty()
    }

    pub fn queue_stats(&self) -> &ConsumerStats {
        self.queue.stats()
    }

    /// Bytes dropped for belonging to a discarded capture.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn store_stats(&self) -> Option<&StoreStats> {
        self.store.as_ref().map(|store| store.stats())
    }
}

/// Both loops stepped together from one thread, one consumer tick per
/// producer tick.
pub struct Analyzer {
    producer: ProducerLoop,
    consumer: ConsumerLoop,
    control: Arc<ControlRegisters>,
    output: Vec<StreamByte>,
    ready: bool,
    last_sample: Sample,
}

impl Analyzer {
    pub fn new(settings: &Settings, control: Arc<ControlRegisters>) -> Result<Analyzer> {
        let (queue_producer, queue_consumer) = cross_domain_queue(settings.queue_depth)?;
        Ok(Analyzer {
            producer: ProducerLoop::new(settings, control.clone(), queue_producer)?,
            consumer: ConsumerLoop::new(settings, queue_consumer)?,
            control,
            output: Vec::new(),
            ready: true,
            last_sample: Sample::default(),
        })
    }

    pub fn control(&self) -> &ControlRegisters {
        &self.control
    }

    pub fn producer(&self) -> &ProducerLoop {
        &self.producer
    }

    /// Whether the reader accepts data; a stalled reader backs up the queue.
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    pub fn tick(&mut self, sample: &Sample) -> Status {
        let status = self.producer.tick(sample);
        self.output.extend(self.consumer.tick(self.ready));
        self.last_sample = *sample;
        status
    }

    /// Feed every sample in `samples`, returning the final status.
    pub fn run(&mut self, samples: impl IntoIterator<Item = Sample>) -> Status {
        let mut status = self.producer.status();
        for sample in samples {
            status = self.tick(&sample);
        }
        status
    }

    /// Keep ticking with a quiet bus until everything buffered has been
    /// read, or `limit` ticks have passed. Returns whether it all arrived.
    pub fn settle(&mut self, limit: usize) -> bool {
        let quiet = Sample {
            rx_active: false,
            data_valid: false,
            ..self.last_sample
        };
        for _ in 0..limit {
            if self.is_settled() {
                return true;
            }
            self.tick(&quiet);
        }
        self.is_settled()
    }

    fn is_settled(&self) -> bool {
        // The producer's view of the queue lags behind, so it only reads
        // empty once the consumer really has taken everything.
        self.producer.is_drained() && self.producer.queue_level() == 0 && self.consumer.is_idle()
    }

    /// Drop data that has crossed over but not been read. A record the
    /// reader has started on is still delivered in full.
    pub fn discard_output(&mut self) {
        info!("Discarding unread capture data");
        self.producer.discard_handed_over();
    }

    /// Bytes read so far, with record boundaries.
    pub fn take_output(&mut self) -> Vec<StreamByte> {
        std::mem::take(&mut self.output)
    }

    pub fn take_bytes(&mut self) -> Vec<u8> {
        self.take_output().into_iter().map(|byte| byte.payload).collect()
    }

    pub fn take_frames(&mut self) -> Vec<Frame> {
        Frame::decode_all(&self.take_bytes())
    }

    pub fn stats(&self) -> CaptureStats {
        CaptureStats {
            engine: self.producer.engine_stats().clone(),
            queue_producer: self.producer.queue_stats().clone(),
            queue_consumer: self.consumer.queue_stats().clone(),
            store: self.consumer.store_stats().cloned(),
            discarded: self.consumer.discarded(),
            ticks: self.producer.ticks(),
        }
    }
}
