//! Packet capture: frames received packets and bus events into a ring buffer.

use std::collections::VecDeque;

use anyhow::bail;
use tracing::{debug, info, warn};

use crate::Result;
use crate::event::EventType;
use crate::frame::{
    EVENT_SIZE_BYTES, Event, HEADER_SIZE_BYTES, MAX_PACKET_SIZE_BYTES, MAX_TIMESTAMP,
    packet_header,
};
use crate::ring::RingBuffer;
use crate::sample::Sample;
use crate::stream::{ByteStream, StreamByte};
use crate::usb::Speed;

/// Events held back while a packet is in progress beyond this are dropped.
const MAX_HELD_EVENTS: usize = 64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureState {
    AwaitStart,
    AwaitPacket,
    CapturePacket,
    Overrun,
    Babble,
}

/// Per-tick status outputs.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub idle: bool,
    pub stopped: bool,
    pub capturing: bool,
    pub overrun: bool,
    pub babble: bool,
    /// Buffered data was dropped on this tick.
    pub discarding: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub packets: u64,
    pub events: u64,
    pub placeholders: u64,
    pub overruns: u64,
    pub babbles: u64,
    pub dropped_events: u64,
}

pub struct PacketCaptureEngine {
    ring: RingBuffer,
    state: CaptureState,
    enable: bool,
    speed: Speed,
    capture_events: bool,
    /// Current tick.
    now: u64,
    /// Tick of the most recently framed item.
    base: u64,
    header_slot: usize,
    packet_length: usize,
    packet_timestamp: u16,
    held: VecDeque<(EventType, u64)>,
    /// Bytes kept by the last discard: the rest of a record already
    /// partly handed downstream.
    retained: usize,
    stats: EngineStats,
}

impl PacketCaptureEngine {
    /// Create an engine over a ring of `ring_capacity` bytes.
    ///
    /// With `capture_events` set, start and stop records are framed around
    /// each capture, and room for one stop record is always kept free.
    pub fn new(ring_capacity: usize, capture_events: bool) -> Result<PacketCaptureEngine> {
        let ring = RingBuffer::new(ring_capacity)?;
        let engine = PacketCaptureEngine {
            ring,
            state: CaptureState::AwaitStart,
            enable: false,
            speed: Speed::Auto,
            capture_events,
            now: 0,
            base: 0,
            header_slot: 0,
            packet_length: 0,
            packet_timestamp: 0,
            held: VecDeque::new(),
            retained: 0,
            stats: EngineStats::default(),
        };
        if ring_capacity < HEADER_SIZE_BYTES + 2 + engine.reserve() {
            bail!("Ring capacity of {ring_capacity} bytes cannot hold a packet");
        }
        Ok(engine)
    }

    pub fn set_enable(&mut self, enable: bool) {
        self.enable = enable;
    }

    /// Speed reported in capture start records.
    pub fn set_speed(&mut self, speed: Speed) {
        self.speed = speed;
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    /// Bytes the last discard left in the ring. Everything handed
    /// downstream before them, and they themselves, belong to the
    /// discarded capture.
    pub fn retained(&self) -> usize {
        self.retained
    }

    /// Advance one tick.
    ///
    /// `event` is the bus event classified on the same tick, if any.
    pub fn tick(&mut self, sample: &Sample, event: Option<EventType>) -> Status {
        use CaptureState::*;
        let mut discarding = false;
        match self.state {
            AwaitStart => {
                if self.enable {
                    // Never replay what an earlier capture left behind.
                    discarding = true;
                    self.discard();
                    if !sample.rx_active {
                        self.arm();
                    }
                }
            }
            AwaitPacket => {
                if !self.enable {
                    self.stop();
                } else if sample.rx_active {
                    self.start_packet(sample);
                }
            }
            CapturePacket => {
                if !sample.rx_active {
                    self.end_packet();
                } else if sample.data_valid {
                    self.capture_byte(sample.data_byte);
                }
            }
            Overrun | Babble => {
                if !self.enable {
                    discarding = true;
                    self.discard();
                    self.set_state(AwaitStart);
                }
            }
        }

        if let Some(event) = event {
            self.hold_event(event);
        }
        if self.state == AwaitPacket {
            self.frame_held_events();
            self.frame_placeholder_if_due();
        }

        self.now += 1;
        self.status(discarding)
    }

    fn status(&self, discarding: bool) -> Status {
        use CaptureState::*;
        Status {
            idle: matches!(self.state, AwaitStart | AwaitPacket),
            stopped: matches!(self.state, AwaitStart | Overrun | Babble),
            capturing: self.state == CapturePacket,
            overrun: self.state == Overrun,
            babble: self.state == Babble,
            discarding,
        }
    }

    fn set_state(&mut self, state: CaptureState) {
        if state != self.state {
            debug!(from = ?self.state, to = ?state, tick = self.now, "Capture state change");
            self.state = state;
        }
    }

    /// Bytes kept free for a stop record.
    fn reserve(&self) -> usize {
        if self.capture_events { EVENT_SIZE_BYTES } else { 0 }
    }

    /// Timestamp of an item framed at `tick`: whole ticks since the last one.
    ///
    /// Placeholders keep this in range, except for a stop record ending a
    /// packet that stayed active for longer than `MAX_TIMESTAMP` ticks; that
    /// one saturates.
    fn timestamp_at(&self, tick: u64) -> u16 {
        let elapsed = tick.saturating_sub(self.base).saturating_sub(1);
        if elapsed > MAX_TIMESTAMP as u64 {
            debug!(elapsed, "Timestamp saturated");
        }
        elapsed.min(MAX_TIMESTAMP as u64) as u16
    }

    fn arm(&mut self) {
        info!(speed = self.speed.description(), "Capture started");
        self.base = self.now;
        self.set_state(CaptureState::AwaitPacket);
        if self.capture_events {
            self.frame_event(EventType::capture_start(self.speed), self.now);
        }
    }

    fn stop(&mut self) {
        info!(packets = self.stats.packets, "Capture stopped");
        if self.capture_events {
            self.frame_stop_event(EventType::CaptureStopNormal);
        }
        self.set_state(CaptureState::AwaitStart);
    }

    fn discard(&mut self) {
        self.ring.discard();
        self.retained = self.ring.len();
        self.drop_held_events();
    }

    fn start_packet(&mut self, sample: &Sample) {
        if !self.ring.fits(HEADER_SIZE_BYTES + self.reserve()) {
            self.enter_overrun();
            return;
        }
        self.packet_timestamp = self.timestamp_at(self.now);
        self.base = self.now;
        self.header_slot = self.ring.cursor();
        for _ in 0..HEADER_SIZE_BYTES {
            self.ring.push_pending(0);
        }
        self.packet_length = 0;
        self.set_state(CaptureState::CapturePacket);
        if sample.data_valid {
            self.capture_byte(sample.data_byte);
        }
    }

    fn capture_byte(&mut self, byte: u8) {
        if self.packet_length == MAX_PACKET_SIZE_BYTES {
            self.enter_babble();
            return;
        }
        // Room for this byte, the pad it would need if it were the last one,
        // and the reserve.
        let pad = (self.packet_length + 1) & 1;
        if !self.ring.fits(1 + pad + self.reserve()) {
            self.enter_overrun();
            return;
        }
        self.ring.push_pending(byte);
        self.packet_length += 1;
    }

    fn end_packet(&mut self) {
        if self.packet_length & 1 == 1 {
            self.ring.push_pending(0);
        }
        let header = packet_header(self.packet_length as u16, self.packet_timestamp);
        self.ring.fill_pending(self.header_slot, &header);
        self.ring.commit();
        self.stats.packets += 1;
        self.set_state(CaptureState::AwaitPacket);
    }

    fn enter_overrun(&mut self) {
        self.ring.abandon();
        self.drop_held_events();
        self.stats.overruns += 1;
        warn!(buffered = self.ring.len(), "Capture buffer overrun");
        self.set_state(CaptureState::Overrun);
        if self.capture_events {
            self.frame_stop_event(EventType::CaptureStopFull);
        }
    }

    fn enter_babble(&mut self) {
        self.ring.abandon();
        self.drop_held_events();
        self.stats.babbles += 1;
        warn!(length = self.packet_length, "Babble: packet exceeds maximum length");
        self.set_state(CaptureState::Babble);
        if self.capture_events {
            self.frame_stop_event(EventType::CaptureStopError);
        }
    }

    fn hold_event(&mut self, event: EventType) {
        match self.state {
            CaptureState::AwaitPacket | CaptureState::CapturePacket
                if self.held.len() < MAX_HELD_EVENTS =>
            {
                self.held.push_back((event, self.now));
            }
            _ => {
                debug!(%event, state = ?self.state, "Dropping event");
                self.stats.dropped_events += 1;
            }
        }
    }

    fn drop_held_events(&mut self) {
        self.stats.dropped_events += self.held.len() as u64;
        self.held.clear();
    }

    fn frame_held_events(&mut self) {
        while self.state == CaptureState::AwaitPacket {
            let Some(&(_, tick)) = self.held.front() else {
                break;
            };
            // A long packet can leave the event out of timestamp range.
            while self.state == CaptureState::AwaitPacket
                && tick > self.base + MAX_TIMESTAMP as u64 + 1
            {
                self.frame_placeholder();
            }
            // An overrun while bridging has dropped the held events.
            if let Some((event, tick)) = self.held.pop_front() {
                self.frame_event(event, tick);
            }
        }
    }

    fn frame_placeholder_if_due(&mut self) {
        if self.state != CaptureState::AwaitPacket || self.now <= self.base {
            return;
        }
        if self.now - self.base - 1 >= MAX_TIMESTAMP as u64 {
            self.frame_placeholder();
        }
    }

    fn frame_placeholder(&mut self) {
        let tick = self.base + MAX_TIMESTAMP as u64 + 1;
        self.frame_event(EventType::Placeholder, tick);
    }

    fn frame_event(&mut self, event: EventType, tick: u64) {
        if !self.ring.fits(EVENT_SIZE_BYTES + self.reserve()) {
            self.enter_overrun();
            return;
        }
        let record = Event::new(event, self.timestamp_at(tick));
        self.ring.push_record(&record.to_bytes());
        self.base = tick;
        if event == EventType::Placeholder {
            self.stats.placeholders += 1;
        } else {
            self.stats.events += 1;
        }
    }

    /// Stop records may use the reserve.
    fn frame_stop_event(&mut self, event: EventType) {
        if !self.ring.fits(EVENT_SIZE_BYTES) {
            self.stats.dropped_events += 1;
            return;
        }
        let record = Event::new(event, self.timestamp_at(self.now));
        self.ring.push_record(&record.to_bytes());
        self.base = self.now;
        self.stats.events += 1;
    }
}

impl ByteStream for PacketCaptureEngine {
    fn peek(&self) -> Option<StreamByte> {
        self.ring.peek()
    }

    fn accept(&mut self) -> Option<StreamByte> {
        self.ring.accept()
    }
}
