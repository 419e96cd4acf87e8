//! Bus timing thresholds, expressed in sample clock cycles.

use anyhow::bail;

use crate::Result;

/// The sample clock rate the reference thresholds are given for.
pub const REFERENCE_CLOCK_HZ: u32 = 60_000_000;

/// Thresholds used by the bus event classifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Timings {
    /// Shortest SE0 accepted as a keep-alive or end-of-resume pulse (666 ns).
    pub pulse_min: u32,
    /// Longest SE0 accepted as a keep-alive or end-of-resume pulse (1.5 µs).
    pub pulse_max: u32,
    /// Minimum duration of a reset, attach or chirp (2.5 µs).
    pub reset: u32,
    /// VBUS must be present this long before it is valid (50 µs).
    pub vbus_debounce: u32,
    /// Wait before classifying the bus after high-speed squelch (200 µs).
    pub hs_suspend_settle: u32,
    /// Budget for the host's chirp sequence (2.5 ms).
    pub host_chirp_timeout: u32,
    /// Idle time before a suspend (3 ms).
    pub suspend: u32,
    /// Budget for the device chirp (7 ms).
    pub device_chirp_timeout: u32,
    /// Minimum K state for a fixed-speed resume (20 ms).
    pub resume: u32,
}

impl Timings {
    /// Thresholds for a 60 MHz sample clock.
    pub const fn reference() -> Timings {
        Timings {
            pulse_min: 40,
            pulse_max: 90,
            reset: 150,
            vbus_debounce: 3_000,
            hs_suspend_settle: 12_000,
            host_chirp_timeout: 150_000,
            suspend: 180_000,
            device_chirp_timeout: 420_000,
            resume: 1_200_000,
        }
    }

    /// Thresholds scaled to a sample clock of `clock_hz`.
    pub fn for_clock(clock_hz: u32) -> Result<Timings> {
        if clock_hz == 0 {
            bail!("Sample clock rate must be non-zero");
        }
        let scale = |cycles: u32| -> u32 {
            let scaled = (cycles as u64 * clock_hz as u64 + REFERENCE_CLOCK_HZ as u64 / 2)
                / REFERENCE_CLOCK_HZ as u64;
            scaled.clamp(1, u32::MAX as u64) as u32
        };
        let reference = Timings::reference();
        Ok(Timings {
            pulse_min: scale(reference.pulse_min),
            pulse_max: scale(reference.pulse_max),
            reset: scale(reference.reset),
            vbus_debounce: scale(reference.vbus_debounce),
            hs_suspend_settle: scale(reference.hs_suspend_settle),
            host_chirp_timeout: scale(reference.host_chirp_timeout),
            suspend: scale(reference.suspend),
            device_chirp_timeout: scale(reference.device_chirp_timeout),
            resume: scale(reference.resume),
        })
    }

    /// Whether an SE0 lasting `cycles` is a keep-alive or end-of-resume pulse.
    pub fn is_pulse(&self, cycles: u32) -> bool {
        (self.pulse_min..=self.pulse_max).contains(&cycles)
    }
}

impl Default for Timings {
    fn default() -> Self {
        Timings::reference()
    }
}
