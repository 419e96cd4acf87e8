//! Framing of packets and events in the capture byte stream.
//!
//! Each record is either an event, `[0xFF, code, ts_hi, ts_lo]`, or a
//! packet, `[len_hi, len_lo, ts_hi, ts_lo, payload..]` followed by a zero pad
//! byte when the payload length is odd.

use crate::event::EventType;

pub const HEADER_SIZE_BYTES: usize = 4;
pub const EVENT_SIZE_BYTES: usize = 4;

/// First byte of every event record.
pub const EVENT_TAG: u8 = 0xFF;

/// Largest packet captured: 1024 bytes of data, a PID and a CRC16.
pub const MAX_PACKET_SIZE_BYTES: usize = 1024 + 1 + 2;

// A packet length can never begin with the event tag.
const _: () = assert!(MAX_PACKET_SIZE_BYTES >> 8 < EVENT_TAG as usize);

pub const MAX_TIMESTAMP: u16 = 0xFFFF;

/// Bytes a packet of `length` occupies once framed, including padding.
pub fn framed_packet_size(length: usize) -> usize {
    HEADER_SIZE_BYTES + length + (length & 1)
}

pub fn packet_header(length: u16, timestamp: u16) -> [u8; HEADER_SIZE_BYTES] {
    let [len_hi, len_lo] = length.to_be_bytes();
    let [ts_hi, ts_lo] = timestamp.to_be_bytes();
    [len_hi, len_lo, ts_hi, ts_lo]
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub code: u8,
    pub timestamp: u16,
}

impl Event {
    pub fn new(event_type: EventType, timestamp: u16) -> Event {
        Event {
            code: event_type.code(),
            timestamp,
        }
    }

    /// The event's type, if it is one that is reported.
    pub fn event_type(&self) -> Option<EventType> {
        EventType::from_code(self.code)
    }

    pub fn to_bytes(&self) -> [u8; EVENT_SIZE_BYTES] {
        let [ts_hi, ts_lo] = self.timestamp.to_be_bytes();
        [EVENT_TAG, self.code, ts_hi, ts_lo]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PacketRecord {
    pub timestamp: u16,
    pub payload: Vec<u8>,
}

impl PacketRecord {
    pub fn length(&self) -> u16 {
        self.payload.len() as u16
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Packet(PacketRecord),
    Event(Event),
}

impl Frame {
    pub fn timestamp(&self) -> u16 {
        match self {
            Frame::Packet(packet) => packet.timestamp,
            Frame::Event(event) => event.timestamp,
        }
    }

    /// Parse the record at the start of `bytes`.
    ///
    /// Returns the record and the number of bytes it occupies, or `None` if
    /// `bytes` does not yet hold a complete record.
    pub fn decode(bytes: &[u8]) -> Option<(Frame, usize)> {
        if bytes.len() < HEADER_SIZE_BYTES {
            return None;
        }
        let timestamp = u16::from_be_bytes([bytes[2], bytes[3]]);
        if bytes[0] == EVENT_TAG {
            let event = Event { code: bytes[1], timestamp };
            return Some((Frame::Event(event), EVENT_SIZE_BYTES));
        }
        let length = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let size = framed_packet_size(length);
        if bytes.len() < size {
            return None;
        }
        let payload = bytes[HEADER_SIZE_BYTES..HEADER_SIZE_BYTES + length].to_vec();
        Some((Frame::Packet(PacketRecord { timestamp, payload }), size))
    }

    /// Parse as many complete records as `bytes` holds.
    pub fn decode_all(mut bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some((frame, size)) = Frame::decode(bytes) {
            frames.push(frame);
            bytes = &bytes[size..];
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bytes() {
        let event = Event::new(EventType::BusReset, 0x1234);
        assert_eq!(event.to_bytes(), [0xFF, 25, 0x12, 0x34]);
    }

    #[test]
    fn decode_padded_packet_then_event() {
        let bytes = [0x00, 0x01, 0x00, 0x07, 0xAB, 0x00, 0xFF, 28, 0x00, 0x02];
        let frames = Frame::decode_all(&bytes);
        assert_eq!(frames, vec![
            Frame::Packet(PacketRecord { timestamp: 7, payload: vec![0xAB] }),
            Frame::Event(Event { code: 28, timestamp: 2 }),
        ]);
    }

    #[test]
    fn incomplete_record() {
        // Missing the pad byte.
        assert_eq!(Frame::decode(&[0x00, 0x01, 0x00, 0x00, 0xAB]), None);
        assert_eq!(Frame::decode(&[0xFF, 28]), None);
    }
}
