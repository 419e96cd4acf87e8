//! Bus event codes, as framed into the capture stream.
//!
//! Codes are part of the wire format and must never be renumbered.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::usb::Speed;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum EventType {
    /// Carries elapsed time only; framed when the timestamp counter wraps.
    Placeholder       = 0,

    CaptureStopNormal = 1,
    CaptureStopFull   = 2,
    CaptureStopError  = 3,

    CaptureStartHigh  = 4,
    CaptureStartFull  = 5,
    CaptureStartLow   = 6,
    CaptureStartAuto  = 7,

    SpeedDetectHigh   = 8,
    SpeedDetectFull   = 9,
    SpeedDetectLow    = 10,
    SpeedDetectAuto   = 11,

    LinestateSe0      = 12,
    LinestateChirpJ   = 13,
    LinestateChirpK   = 14,
    LinestateChirpSe1 = 15,
    LinestateLsJ      = 16,
    LinestateLsK      = 17,
    LinestateFsJ      = 18,
    LinestateFsK      = 19,
    LinestateSe1      = 20,

    VbusInvalid       = 21,
    VbusValid         = 22,
    LsAttach          = 23,
    FsAttach          = 24,
    BusReset          = 25,
    DeviceChirpValid  = 26,
    HostChirpValid    = 27,
    Suspend           = 28,
    Resume            = 29,
    LsKeepalive       = 30,
}

const CAPTURE_START_BASE: u8 = 4;
const SPEED_DETECT_BASE: u8 = 8;

impl EventType {
    /// Look up a reportable event from its wire code.
    ///
    /// Returns `None` for unknown codes and for timestamp placeholders.
    pub fn from_code(code: u8) -> Option<EventType> {
        match EventType::try_from(code) {
            Ok(EventType::Placeholder) | Err(_) => None,
            Ok(event) => Some(event),
        }
    }

    pub fn code(self) -> u8 {
        self.into()
    }

    /// Event marking the start of a capture at the given speed setting.
    pub fn capture_start(speed: Speed) -> EventType {
        Self::with_speed(CAPTURE_START_BASE, speed)
    }

    /// Event marking a change of detected bus speed.
    pub fn speed_detect(speed: Speed) -> EventType {
        Self::with_speed(SPEED_DETECT_BASE, speed)
    }

    fn with_speed(base: u8, speed: Speed) -> EventType {
        // Speed values are 0..=3, so every base + speed is a defined code.
        EventType::try_from(base + u8::from(speed)).unwrap_or(EventType::Placeholder)
    }

    pub fn description(&self) -> &'static str {
        use EventType::*;
        match self {
            Placeholder => "Timestamp placeholder",
            CaptureStopNormal => "Capture stopped",
            CaptureStopFull => "Capture stopped: buffer full",
            CaptureStopError => "Capture stopped: error",
            CaptureStartHigh => "Capture started at High Speed",
            CaptureStartFull => "Capture started at Full Speed",
            CaptureStartLow => "Capture started at Low Speed",
            CaptureStartAuto => "Capture started with automatic speed detection",
            SpeedDetectHigh => "High Speed detected",
            SpeedDetectFull => "Full Speed detected",
            SpeedDetectLow => "Low Speed detected",
            SpeedDetectAuto => "Speed unknown",
            LinestateSe0 => "Line state SE0",
            LinestateChirpJ => "Line state Chirp J",
            LinestateChirpK => "Line state Chirp K",
            LinestateChirpSe1 => "Line state Chirp SE1",
            LinestateLsJ => "Line state LS J",
            LinestateLsK => "Line state LS K",
            LinestateFsJ => "Line state FS J",
            LinestateFsK => "Line state FS K",
            LinestateSe1 => "Line state SE1",
            VbusInvalid => "VBUS invalid",
            VbusValid => "VBUS valid",
            LsAttach => "Low Speed device attached",
            FsAttach => "Full Speed device attached",
            BusReset => "Bus reset",
            DeviceChirpValid => "Device chirp",
            HostChirpValid => "Host chirp",
            Suspend => "Suspend",
            Resume => "Resume",
            LsKeepalive => "Low Speed keep-alive",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(EventType::Placeholder.code(), 0);
        assert_eq!(EventType::BusReset.code(), 25);
        assert_eq!(EventType::LsKeepalive.code(), 30);
        assert_eq!(EventType::VbusInvalid.code(), 21);
    }

    #[test]
    fn speed_relative_codes() {
        assert_eq!(EventType::capture_start(Speed::Low), EventType::CaptureStartLow);
        assert_eq!(EventType::capture_start(Speed::Auto), EventType::CaptureStartAuto);
        assert_eq!(EventType::speed_detect(Speed::High), EventType::SpeedDetectHigh);
        assert_eq!(EventType::speed_detect(Speed::Full), EventType::SpeedDetectFull);
    }

    #[test]
    fn placeholders_and_unknown_codes_are_not_reported() {
        assert_eq!(EventType::from_code(0), None);
        assert_eq!(EventType::from_code(31), None);
        assert_eq!(EventType::from_code(0xFF), None);
        assert_eq!(EventType::from_code(28), Some(EventType::Suspend));
    }
}
