//! Capture configuration and statistics.

use anyhow::bail;
use merge::Merge;

use crate::Result;
use crate::backing::StoreStats;
use crate::cdc::{ConsumerStats, ProducerStats};
use crate::engine::EngineStats;
use crate::timing::{REFERENCE_CLOCK_HZ, Timings};
use crate::usb::Speed;

/// Capture configuration. Unset fields take the value of the first layer
/// merged in that sets them, then the defaults.
#[derive(Clone, Debug, Default, Merge)]
pub struct CaptureConfig {
    // Producer side.
    pub ring_capacity: Option<usize>,
    pub clock_hz: Option<u32>,
    pub speed: Option<Speed>,
    pub capture_events: Option<bool>,

    // Between the loops.
    pub queue_depth: Option<usize>,

    // Consumer side.
    pub backing_store: Option<bool>,
    pub backing_store_words: Option<usize>,
    pub memory_latency: Option<u32>,
    pub memory_recovery: Option<u32>,
    pub output_buffer_depth: Option<usize>,
    pub read_threshold: Option<usize>,
    pub report_channel_depth: Option<usize>,
    pub report_batch: Option<usize>,
}

impl CaptureConfig {
    pub fn defaults() -> CaptureConfig {
        CaptureConfig {
            ring_capacity: Some(65536),
            clock_hz: Some(REFERENCE_CLOCK_HZ),
            speed: Some(Speed::Auto),
            capture_events: Some(false),
            queue_depth: Some(1024),
            backing_store: Some(false),
            backing_store_words: Some(4 * 1024 * 1024),
            memory_latency: Some(7),
            memory_recovery: Some(3),
            output_buffer_depth: Some(2),
            read_threshold: None,
            report_channel_depth: Some(16),
            report_batch: Some(512),
        }
    }

    /// Fill in defaults and validate.
    pub fn resolve(mut self) -> Result<Settings> {
        self.merge(CaptureConfig::defaults());
        let clock_hz = self.clock_hz.unwrap_or(REFERENCE_CLOCK_HZ);
        let settings = Settings {
            ring_capacity: self.ring_capacity.unwrap_or_default(),
            clock_hz,
            timings: Timings::for_clock(clock_hz)?,
            speed: self.speed.unwrap_or(Speed::Auto),
            capture_events: self.capture_events.unwrap_or_default(),
            queue_depth: self.queue_depth.unwrap_or_default(),
            backing_store: match self.backing_store {
                Some(true) => Some(BackingStoreSettings {
                    words: self.backing_store_words.unwrap_or_default(),
                    latency: self.memory_latency.unwrap_or_default(),
                    recovery: self.memory_recovery.unwrap_or_default(),
                    output_depth: self.output_buffer_depth.unwrap_or_default().max(2),
                    read_threshold: self.read_threshold,
                }),
                _ => None,
            },
            report_channel_depth: self.report_channel_depth.unwrap_or_default(),
            report_batch: self.report_batch.unwrap_or_default(),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackingStoreSettings {
    pub words: usize,
    pub latency: u32,
    pub recovery: u32,
    pub output_depth: usize,
    pub read_threshold: Option<usize>,
}

/// Validated configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Settings {
    pub ring_capacity: usize,
    pub clock_hz: u32,
    pub timings: Timings,
    pub speed: Speed,
    pub capture_events: bool,
    pub queue_depth: usize,
    pub backing_store: Option<BackingStoreSettings>,
    pub report_channel_depth: usize,
    pub report_batch: usize,
}

impl Settings {
    fn validate(&self) -> Result<()> {
        if !self.ring_capacity.is_power_of_two() {
            bail!("Ring capacity must be a power of two, got {}", self.ring_capacity);
        }
        if !self.queue_depth.is_power_of_two() || self.queue_depth < 2 {
            bail!("Queue depth must be a power of two of at least 2, got {}", self.queue_depth);
        }
        if let Some(store) = &self.backing_store {
            if store.words < 2 {
                bail!("Backing store must hold at least two words");
            }
            if let Some(threshold) = store.read_threshold {
                if threshold == 0 || threshold >= store.output_depth {
                    bail!(
                        "Read threshold must be between 1 and {}, got {threshold}",
                        store.output_depth - 1
                    );
                }
            }
        }
        if self.report_channel_depth == 0 || self.report_batch == 0 {
            bail!("Report channel depth and batch size must be non-zero");
        }
        Ok(())
    }
}

/// Statistics gathered over a capture.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub engine: EngineStats,
    pub queue_producer: ProducerStats,
    pub queue_consumer: ConsumerStats,
    pub store: Option<StoreStats>,
    /// Bytes of discarded captures dropped on their way to the reader.
    pub discarded: u64,
    pub ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = CaptureConfig::default().resolve().unwrap();
        assert_eq!(settings.ring_capacity, 65536);
        assert_eq!(settings.queue_depth, 1024);
        assert_eq!(settings.speed, Speed::Auto);
        assert_eq!(settings.backing_store, None);
        assert_eq!(settings.timings, Timings::reference());
    }

    #[test]
    fn first_layer_wins() {
        let mut config = CaptureConfig {
            queue_depth: Some(64),
            ..Default::default()
        };
        config.merge(CaptureConfig {
            queue_depth: Some(128),
            backing_store: Some(true),
            output_buffer_depth: Some(1),
            ..Default::default()
        });
        let settings = config.resolve().unwrap();
        assert_eq!(settings.queue_depth, 64);
        let store = settings.backing_store.unwrap();
        assert_eq!(store.output_depth, 2);
        assert_eq!(store.words, 4 * 1024 * 1024);
    }

    #[test]
    fn rejects_bad_sizes() {
        let config = CaptureConfig { ring_capacity: Some(1000), ..Default::default() };
        assert!(config.resolve().is_err());
        let config = CaptureConfig { clock_hz: Some(0), ..Default::default() };
        assert!(config.resolve().is_err());
        let config = CaptureConfig {
            backing_store: Some(true),
            read_threshold: Some(2),
            ..Default::default()
        };
        assert!(config.resolve().is_err());
    }
}
