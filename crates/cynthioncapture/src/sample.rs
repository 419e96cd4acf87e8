//! Per-tick transceiver samples and sources of them.

use crate::usb::LineState;

/// What the transceiver reports on one tick of the sample clock.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub line_state: LineState,
    pub data_byte: u8,
    pub data_valid: bool,
    pub rx_active: bool,
    pub vbus_present: bool,
}

impl Sample {
    /// A quiet bus holding `line_state`.
    pub fn idle(line_state: LineState, vbus_present: bool) -> Sample {
        Sample {
            line_state,
            vbus_present,
            ..Default::default()
        }
    }

    /// A tick of packet reception carrying `byte`.
    pub fn data(line_state: LineState, vbus_present: bool, byte: u8) -> Sample {
        Sample {
            line_state,
            data_byte: byte,
            data_valid: true,
            rx_active: true,
            vbus_present,
        }
    }
}

pub trait SampleSource {
    /// The next sample, or `None` once the source is exhausted.
    fn next_sample(&mut self) -> Option<Sample>;
}

impl<I> SampleSource for I
where
    I: Iterator<Item = Sample>,
{
    fn next_sample(&mut self) -> Option<Sample> {
        self.next()
    }
}

/// Builds a sequence of samples from bus-level steps.
#[derive(Clone, Debug)]
pub struct SampleScript {
    samples: Vec<Sample>,
    line_state: LineState,
    vbus_present: bool,
}

impl Default for SampleScript {
    fn default() -> Self {
        SampleScript::new()
    }
}

impl SampleScript {
    /// Starts with VBUS present and the bus in full-speed idle.
    pub fn new() -> SampleScript {
        SampleScript {
            samples: Vec::new(),
            line_state: LineState::DPlus,
            vbus_present: true,
        }
    }

    /// Change VBUS for subsequent samples.
    pub fn vbus(mut self, present: bool) -> Self {
        self.vbus_present = present;
        self
    }

    /// Drive `line_state` for `ticks` samples; it stays in effect afterwards.
    pub fn line(mut self, line_state: LineState, ticks: usize) -> Self {
        self.line_state = line_state;
        self.idle(ticks)
    }

    /// Hold the current line state for `ticks` samples.
    pub fn idle(mut self, ticks: usize) -> Self {
        let sample = Sample::idle(self.line_state, self.vbus_present);
        self.samples.extend(std::iter::repeat_n(sample, ticks));
        self
    }

    /// Receive a packet: one sample per byte, then the tick `rx_active` drops.
    pub fn packet(mut self, bytes: &[u8]) -> Self {
        let (line_state, vbus) = (self.line_state, self.vbus_present);
        self.samples
            .extend(bytes.iter().map(|&byte| Sample::data(line_state, vbus, byte)));
        self.idle(1)
    }

    /// Append an arbitrary sample.
    pub fn sample(mut self, sample: Sample) -> Self {
        self.samples.push(sample);
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn build(self) -> Vec<Sample> {
        self.samples
    }
}

impl IntoIterator for SampleScript {
    type Item = Sample;
    type IntoIter = std::vec::IntoIter<Sample>;

    fn into_iter(self) -> Self::IntoIter {
        self.samples.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_ends_with_inactive_tick() {
        let samples = SampleScript::new().vbus(false).idle(2).packet(&[1, 2]).build();
        assert_eq!(samples.len(), 5);
        assert!(!samples[1].rx_active);
        assert_eq!(samples[2], Sample::data(LineState::DPlus, false, 1));
        assert!(samples[3].data_valid);
        assert!(!samples[4].rx_active);
    }

    #[test]
    fn line_state_persists() {
        let samples = SampleScript::new().line(LineState::Se0, 1).idle(1).build();
        assert!(samples.iter().all(|s| s.line_state == LineState::Se0));
    }
}
