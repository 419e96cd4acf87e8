//! Host-side decoding of the capture byte stream.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::Error;
use tracing::warn;

use crate::event::EventType;
use crate::frame::Frame;
use crate::timing::REFERENCE_CLOCK_HZ;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimestampedEvent {
    Packet { timestamp_ns: u64, bytes: Vec<u8> },
    Event { timestamp_ns: u64, event_type: EventType },
}

impl TimestampedEvent {
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            TimestampedEvent::Packet { timestamp_ns, .. }
            | TimestampedEvent::Event { timestamp_ns, .. } => *timestamp_ns,
        }
    }
}

pub type EventResult = Result<TimestampedEvent, Error>;

pub enum EventPoll {
    Event(EventResult),
    Timeout,
    Ended,
}

pub trait EventIterator: Iterator<Item = EventResult> + Send {
    /// Wait at most `timeout` for the next event.
    fn poll_next(&mut self, timeout: Duration) -> EventPoll;
}

/// Convert 60MHz clock cycles to nanoseconds, rounding down.
fn clk_to_ns(clk_cycles: u64) -> u64 {
    const TABLE: [u64; 3] = [0, 16, 33];
    let quotient = clk_cycles / 3;
    let remainder = clk_cycles % 3;
    quotient * 50 + TABLE[remainder as usize]
}

fn cycles_to_ns(clk_cycles: u64, clock_hz: u32) -> u64 {
    if clock_hz == REFERENCE_CLOCK_HZ {
        clk_to_ns(clk_cycles)
    } else {
        (clk_cycles as u128 * 1_000_000_000 / clock_hz as u128) as u64
    }
}

/// Parses framed records into timestamped packets and events.
pub struct ReportDecoder {
    buffer: VecDeque<u8>,
    total_clk_cycles: u64,
    clock_hz: u32,
}

impl ReportDecoder {
    pub fn new(clock_hz: u32) -> ReportDecoder {
        ReportDecoder {
            buffer: VecDeque::new(),
            total_clk_cycles: 0,
            clock_hz,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes);
    }

    /// Bytes received but not yet decoded.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial record, returning its length.
    pub fn discard_pending(&mut self) -> usize {
        let pending = self.buffer.len();
        self.buffer.clear();
        pending
    }

    pub fn next_event(&mut self) -> Option<TimestampedEvent> {
        use TimestampedEvent::*;
        // Loop over placeholders and unknown events.
        loop {
            let (frame, size) = Frame::decode(self.buffer.make_contiguous())?;
            self.buffer.drain(0..size);
            self.total_clk_cycles += frame.timestamp() as u64;
            let timestamp_ns = cycles_to_ns(self.total_clk_cycles, self.clock_hz);
            match frame {
                Frame::Packet(packet) => {
                    return Some(Packet { timestamp_ns, bytes: packet.payload });
                }
                Frame::Event(event) => {
                    if let Some(event_type) = event.event_type() {
                        if event_type == EventType::CaptureStopFull {
                            warn!("Capture stopped because the analyzer's buffer was full");
                        }
                        return Some(Event { timestamp_ns, event_type });
                    }
                }
            }
        }
    }
}

enum WaitResult {
    Received,
    Timeout,
    Ended,
}

/// Timestamped events decoded from the bytes sent by the consumer loop.
pub struct ReportStream {
    data_rx: mpsc::Receiver<Vec<u8>>,
    decoder: ReportDecoder,
}

impl ReportStream {
    pub fn new(data_rx: mpsc::Receiver<Vec<u8>>, clock_hz: u32) -> ReportStream {
        ReportStream {
            data_rx,
            decoder: ReportDecoder::new(clock_hz),
        }
    }

    fn wait_for_next_buffer(&mut self, timeout: Option<Duration>) -> WaitResult {
        let recv_result = match timeout {
            Some(timeout) => self.data_rx.recv_timeout(timeout),
            None => self
                .data_rx
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match recv_result {
            Ok(buffer) => {
                self.decoder.push(&buffer);
                WaitResult::Received
            }
            Err(RecvTimeoutError::Timeout) => WaitResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => WaitResult::Ended,
        }
    }
}

impl EventIterator for ReportStream {
    fn poll_next(&mut self, timeout: Duration) -> EventPoll {
        loop {
            match self.decoder.next_event() {
                Some(event) => return EventPoll::Event(Ok(event)),
                None => match self.wait_for_next_buffer(Some(timeout)) {
                    WaitResult::Received => continue,
                    WaitResult::Timeout => return EventPoll::Timeout,
                    WaitResult::Ended => return EventPoll::Ended,
                },
            }
        }
    }
}

impl Iterator for ReportStream {
    type Item = EventResult;

    fn next(&mut self) -> Option<EventResult> {
        loop {
            // Do we have another event already in the buffer?
            match self.decoder.next_event() {
                Some(event) => return Some(Ok(event)),
                // No; wait for more data from the consumer loop.
                None => match self.wait_for_next_buffer(None) {
                    WaitResult::Received | WaitResult::Timeout => continue,
                    WaitResult::Ended => {
                        let leftover = self.decoder.discard_pending();
                        if leftover > 0 {
                            return Some(Err(Error::msg(format!(
                                "Capture ended with {leftover} bytes of an incomplete record"
                            ))));
                        }
                        return None;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thirds_of_a_cycle() {
        assert_eq!(clk_to_ns(1), 16);
        assert_eq!(clk_to_ns(2), 33);
        assert_eq!(clk_to_ns(3), 50);
        assert_eq!(cycles_to_ns(48, 48_000_000), 1000);
    }

    #[test]
    fn decodes_across_pushes() {
        let mut decoder = ReportDecoder::new(REFERENCE_CLOCK_HZ);
        decoder.push(&[0xFF, 0x00, 0xFF, 0xFF, 0x00, 0x01, 0x00]);
        assert_eq!(decoder.next_event(), None);
        decoder.push(&[0x03, 0xAB]);
        // Still waiting for the pad byte.
        assert_eq!(decoder.next_event(), None);
        decoder.push(&[0x00, 0xFF, 25, 0x00, 0x02]);
        assert_eq!(decoder.next_event(), Some(TimestampedEvent::Packet {
            timestamp_ns: clk_to_ns(0xFFFF + 3),
            bytes: vec![0xAB],
        }));
        assert_eq!(decoder.next_event(), Some(TimestampedEvent::Event {
            timestamp_ns: clk_to_ns(0xFFFF + 5),
            event_type: EventType::BusReset,
        }));
        assert_eq!(decoder.next_event(), None);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn stream_ends_when_sender_drops() {
        let (tx, rx) = mpsc::sync_channel(4);
        let mut stream = ReportStream::new(rx, REFERENCE_CLOCK_HZ);
        tx.send(vec![0x00, 0x02, 0x00, 0x00, 1, 2]).unwrap();
        assert!(matches!(stream.poll_next(Duration::from_millis(1)), EventPoll::Event(Ok(_))));
        assert!(matches!(stream.poll_next(Duration::from_millis(1)), EventPoll::Timeout));
        tx.send(vec![0xFF]).unwrap();
        drop(tx);
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());
    }
}
