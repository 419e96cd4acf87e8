//! Code describing the USB standard and its bus signalling.

use num_enum::{FromPrimitive, IntoPrimitive};

use crate::event::EventType;

#[derive(Copy, Clone, Debug, FromPrimitive, IntoPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum Speed {
    #[default]
    High = 0,
    Full = 1,
    Low  = 2,
    Auto = 3,
}

impl Speed {
    /// How this speed setting should be displayed.
    pub fn description(&self) -> &'static str {
        use Speed::*;
        match self {
            Auto => "Auto",
            High => "High (480Mbps)",
            Full => "Full (12Mbps)",
            Low => "Low (1.5Mbps)",
        }
    }

    /// Bit representing this speed in the capability mask.
    pub fn mask(&self) -> u8 {
        use Speed::*;
        match self {
            Auto => 0b0001,
            Low => 0b0010,
            Full => 0b0100,
            High => 0b1000,
        }
    }

    /// Decode a capability mask into the speeds it advertises.
    pub fn from_mask(mask: u8) -> Vec<Speed> {
        use Speed::*;
        [Auto, High, Full, Low]
            .into_iter()
            .filter(|speed| mask & speed.mask() != 0)
            .collect()
    }
}

/// The 2-bit UTMI line state.
///
/// Which of the two single-ended levels is J and which is K depends on the
/// signalling speed; see [`Signalling`].
#[derive(Copy, Clone, Debug, Default, FromPrimitive, IntoPrimitive, PartialEq, Eq)]
#[repr(u8)]
pub enum LineState {
    #[default]
    Se0    = 0b00,
    /// D+ high: J at full and high speed, K at low speed.
    DPlus  = 0b01,
    /// D- high: K at full and high speed, J at low speed.
    DMinus = 0b10,
    Se1    = 0b11,
}

impl LineState {
    /// Interpret the two low bits of a PHY line state register.
    pub fn from_bits(bits: u8) -> LineState {
        LineState::from(bits & 0b11)
    }
}

/// The signalling in effect when interpreting line states.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Signalling {
    Low,
    Full,
    /// Full-speed levels observed during the high-speed detection handshake.
    Chirp,
}

impl Signalling {
    /// The idle (J) state.
    pub fn idle(self) -> LineState {
        match self {
            Signalling::Low => LineState::DMinus,
            Signalling::Full | Signalling::Chirp => LineState::DPlus,
        }
    }

    /// The resume (K) state.
    pub fn resume(self) -> LineState {
        match self {
            Signalling::Low => LineState::DPlus,
            Signalling::Full | Signalling::Chirp => LineState::DMinus,
        }
    }

    /// The event reported when the bus enters `state` under this signalling.
    pub fn event(self, state: LineState) -> EventType {
        use EventType::*;
        const LOW: [EventType; 4] = [LinestateSe0, LinestateLsK, LinestateLsJ, LinestateSe1];
        const FULL: [EventType; 4] = [LinestateSe0, LinestateFsJ, LinestateFsK, LinestateSe1];
        const CHIRP: [EventType; 4] = [LinestateSe0, LinestateChirpJ, LinestateChirpK, LinestateChirpSe1];
        let table = match self {
            Signalling::Low => &LOW,
            Signalling::Full => &FULL,
            Signalling::Chirp => &CHIRP,
        };
        table[u8::from(state) as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_mask_roundtrip() {
        let mask = Speed::Low.mask() | Speed::Full.mask() | Speed::High.mask();
        assert_eq!(Speed::from_mask(mask), vec![Speed::High, Speed::Full, Speed::Low]);
        assert_eq!(Speed::from_mask(0), vec![]);
    }

    #[test]
    fn low_speed_swaps_j_and_k() {
        assert_eq!(Signalling::Full.idle(), Signalling::Low.resume());
        assert_eq!(Signalling::Low.idle(), Signalling::Full.resume());
        assert_eq!(Signalling::Low.event(LineState::DMinus), EventType::LinestateLsJ);
        assert_eq!(Signalling::Full.event(LineState::DMinus), EventType::LinestateFsK);
        assert_eq!(Signalling::Chirp.event(LineState::DMinus), EventType::LinestateChirpK);
    }

    #[test]
    fn line_state_ignores_upper_bits() {
        assert_eq!(LineState::from_bits(0b1111_1101), LineState::DPlus);
        assert_eq!(LineState::from_bits(0b0000_0011), LineState::Se1);
    }
}
