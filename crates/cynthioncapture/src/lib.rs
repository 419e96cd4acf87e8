#[macro_use]
extern crate bitfield;

pub mod analyzer;
pub mod backing;
pub mod capture;
pub mod cdc;
pub mod classifier;
pub mod control;
pub mod engine;
pub mod event;
pub mod frame;
pub mod report;
pub mod ring;
pub mod runtime;
pub mod sample;
pub mod stream;
pub mod timing;
pub mod usb;
pub mod util;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;

use crate::capture::{CaptureConfig, CaptureStats, Settings};
use crate::control::ControlRegisters;
use crate::report::{EventIterator, EventPoll, EventResult, ReportStream};
use crate::runtime::CaptureStop;
use crate::sample::SampleSource;

pub type Result<T> = std::result::Result<T, Error>;

/// A capture pipeline and the control registers that drive it.
pub struct Capture {
    settings: Settings,
    control: Arc<ControlRegisters>,
}

impl Capture {
    pub fn new(config: CaptureConfig) -> Result<Self> {
        Ok(Self {
            settings: config.resolve()?,
            control: Arc::new(ControlRegisters::default()),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn control(&self) -> &Arc<ControlRegisters> {
        &self.control
    }

    pub fn supported_speeds(&self) -> Vec<Speed> {
        self.control.supported_speeds()
    }

    /// Capture at the configured speed.
    pub fn start<S>(&self, source: S) -> Result<CaptureStream>
    where
        S: SampleSource + Send + 'static,
    {
        self.start_capture(self.settings.speed, source)
    }

    pub fn start_capture<S>(&self, speed: Speed, source: S) -> Result<CaptureStream>
    where
        S: SampleSource + Send + 'static,
    {
        self.control.start_capture(speed)?;
        let (events, stop) = runtime::spawn(&self.settings, self.control.clone(), source)?;
        Ok(CaptureStream {
            events,
            stop: Some(stop),
            control: self.control.clone(),
        })
    }
}

pub struct CaptureStream {
    events: ReportStream,
    stop: Option<CaptureStop>,
    control: Arc<ControlRegisters>,
}

impl CaptureStream {
    /// Disable capture and stop the capture threads.
    pub fn stop(mut self) -> Result<CaptureStats> {
        self.control.stop_capture();
        match self.stop.take() {
            Some(stop) => stop.stop(),
            None => Ok(CaptureStats::default()),
        }
    }

    /// Wait for the sample source to run dry and its data to be reported.
    ///
    /// Events not yet read from this stream are dropped.
    pub fn finish(mut self) -> Result<CaptureStats> {
        // Drain so the consumer is never left blocked on a full channel.
        for _ in self.events.by_ref() {}
        self.control.stop_capture();
        match self.stop.take() {
            Some(stop) => stop.wait(),
            None => Ok(CaptureStats::default()),
        }
    }
}

impl Iterator for CaptureStream {
    type Item = EventResult;

    fn next(&mut self) -> Option<Self::Item> {
        self.events.next()
    }
}

impl EventIterator for CaptureStream {
    fn poll_next(&mut self, timeout: Duration) -> EventPoll {
        self.events.poll_next(timeout)
    }
}

pub use crate::analyzer::Analyzer;
pub use crate::classifier::BusEventClassifier;
pub use crate::engine::PacketCaptureEngine;
pub use crate::report::TimestampedEvent;
pub use crate::sample::{Sample, SampleScript};
pub use crate::{event::EventType, usb::LineState, usb::Speed};
