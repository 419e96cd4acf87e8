//! Byte streams with a valid/ready/last handshake.

/// A byte in transit, flagged when it ends a framed record.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamByte {
    pub payload: u8,
    pub last: bool,
}

impl StreamByte {
    pub fn new(payload: u8, last: bool) -> StreamByte {
        StreamByte { payload, last }
    }

    /// Pack into a 16-bit storage word.
    pub fn to_word(self) -> u16 {
        self.payload as u16 | (self.last as u16) << 8
    }

    pub fn from_word(word: u16) -> StreamByte {
        StreamByte {
            payload: word as u8,
            last: word & 0x100 != 0,
        }
    }
}

/// The sending side of a handshake.
///
/// `peek` returning `Some` is `valid`; calling `accept` is `ready` for one
/// transfer.
pub trait ByteStream {
    fn peek(&self) -> Option<StreamByte>;

    fn accept(&mut self) -> Option<StreamByte>;
}
