//! Register model of the analyzer's vendor control requests.

use std::sync::atomic::{AtomicU8, Ordering};

use anyhow::{Context as ErrorContext, bail};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::Result;
use crate::usb::Speed;

#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Request {
    GetState = 0,
    SetState = 1,
    GetSpeeds = 2,
}

bitfield! {
    #[derive(Copy, Clone, Default, PartialEq, Eq)]
    pub struct State(u8);
    impl Debug;
    pub bool, enable, set_enable: 0;
    pub u8, from into Speed, speed, set_speed: 2, 1;
}

impl State {
    pub fn capturing(speed: Speed) -> State {
        let mut state = State(0);
        state.set_speed(speed);
        state.set_enable(true);
        state
    }
}

/// The state register, shared between the host and the capture loop.
pub struct ControlRegisters {
    state: AtomicU8,
    speeds: u8,
}

impl Default for ControlRegisters {
    fn default() -> Self {
        use Speed::*;
        ControlRegisters::new(&[Auto, High, Full, Low])
    }
}

impl ControlRegisters {
    /// Registers advertising `speeds`; capture starts disabled, with
    /// automatic speed detection.
    pub fn new(speeds: &[Speed]) -> ControlRegisters {
        let mut state = State(0);
        state.set_speed(Speed::Auto);
        ControlRegisters {
            state: AtomicU8::new(state.0),
            speeds: speeds.iter().fold(0, |mask, speed| mask | speed.mask()),
        }
    }

    pub fn state(&self) -> State {
        State(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state.0, Ordering::Release);
    }

    pub fn supported_speeds(&self) -> Vec<Speed> {
        Speed::from_mask(self.speeds)
    }

    pub fn start_capture(&self, speed: Speed) -> Result<()> {
        if self.speeds & speed.mask() == 0 {
            bail!("Speed {} is not supported", speed.description());
        }
        self.set_state(State::capturing(speed));
        Ok(())
    }

    pub fn stop_capture(&self) {
        let mut state = self.state();
        state.set_enable(false);
        self.set_state(state);
    }

    /// Handle a vendor request, returning the response byte for reads.
    pub fn handle(&self, request: u8, value: u16) -> Result<Option<u8>> {
        let request = Request::try_from(request)
            .map_err(|_| anyhow::anyhow!("Unsupported request {request}"))?;
        match request {
            Request::GetState => Ok(Some(self.state().0)),
            Request::SetState => {
                let byte = u8::try_from(value)
                    .context("State value does not fit in a byte")?;
                let state = State(byte);
                if self.speeds & state.speed().mask() == 0 {
                    bail!("Speed {} is not supported", state.speed().description());
                }
                self.set_state(state);
                Ok(None)
            }
            Request::GetSpeeds => Ok(Some(self.speeds)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_layout() {
        let state = State::capturing(Speed::Low);
        assert_eq!(state.0, 0b101);
        assert_eq!(State(0b110).speed(), Speed::Auto);
        assert!(!State(0b110).enable());
    }

    #[test]
    fn requests() {
        let registers = ControlRegisters::new(&[Speed::Low, Speed::Full, Speed::High]);
        assert_eq!(registers.handle(2, 0).unwrap(), Some(0b1110));
        assert_eq!(registers.handle(1, 0b011).unwrap(), None);
        assert_eq!(registers.handle(0, 0).unwrap(), Some(0b011));
        assert_eq!(registers.state().speed(), Speed::Full);
        assert!(registers.state().enable());

        // Auto isn't advertised here.
        assert!(registers.handle(1, 0b111).is_err());
        assert!(registers.handle(1, 0x100).is_err());
        assert!(registers.handle(9, 0).is_err());
    }

    #[test]
    fn stop_keeps_speed() {
        let registers = ControlRegisters::default();
        assert_eq!(registers.state().speed(), Speed::Auto);
        registers.start_capture(Speed::High).unwrap();
        registers.stop_capture();
        assert_eq!(registers.state(), State(0));
        registers.start_capture(Speed::Full).unwrap();
        registers.stop_capture();
        assert_eq!(registers.state().speed(), Speed::Full);
        assert_eq!(registers.supported_speeds().len(), 4);
    }
}
