use std::time::Duration;

use anyhow::Result;
use cynthioncapture::capture::CaptureConfig;
use cynthioncapture::report::{EventIterator, EventPoll};
use cynthioncapture::{Capture, EventType, LineState, Sample, SampleScript, Speed, TimestampedEvent};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn capture(config: CaptureConfig) -> Capture {
    init_logging();
    Capture::new(config).unwrap()
}

#[test]
fn captured_packets_are_reported() -> Result<()> {
    let capture = capture(CaptureConfig {
        capture_events: Some(true),
        queue_depth: Some(16),
        report_batch: Some(8),
        ..Default::default()
    });
    let script = SampleScript::new()
        .vbus(false)
        .idle(10)
        .packet(&[1, 2, 3])
        .idle(100)
        .packet(&[4]);
    let mut stream = capture.start_capture(Speed::Auto, script.build().into_iter())?;

    let events = stream.by_ref().collect::<Result<Vec<_>>>()?;
    assert_eq!(events, vec![
        TimestampedEvent::Event { timestamp_ns: 0, event_type: EventType::CaptureStartAuto },
        TimestampedEvent::Packet { timestamp_ns: 150, bytes: vec![1, 2, 3] },
        TimestampedEvent::Packet { timestamp_ns: 1866, bytes: vec![4] },
    ]);

    let stats = stream.finish()?;
    assert_eq!(stats.engine.packets, 2);
    assert_eq!(stats.queue_producer.pushed, 4 + 8 + 6);
    assert_eq!(stats.queue_consumer.popped, 4 + 8 + 6);
    assert!(stats.ticks >= 119);
    Ok(())
}

#[test]
fn backing_store_in_the_threaded_pipeline() -> Result<()> {
    let capture = capture(CaptureConfig {
        queue_depth: Some(8),
        backing_store: Some(true),
        backing_store_words: Some(256),
        report_channel_depth: Some(1),
        report_batch: Some(4),
        ..Default::default()
    });
    let mut script = SampleScript::new().vbus(false).idle(1);
    for n in 0u8..20 {
        script = script.packet(&[n; 7]).idle(3);
    }
    let stream = capture.start(script.into_iter())?;

    let packets: Vec<Vec<u8>> = stream
        .map(|event| match event {
            Ok(TimestampedEvent::Packet { bytes, .. }) => bytes,
            other => panic!("unexpected {other:?}"),
        })
        .collect();
    let expected: Vec<Vec<u8>> = (0u8..20).map(|n| vec![n; 7]).collect();
    assert_eq!(packets, expected);
    Ok(())
}

#[test]
fn stop_ends_an_endless_capture() -> Result<()> {
    let capture = capture(CaptureConfig {
        capture_events: Some(true),
        ..Default::default()
    });
    let quiet = std::iter::repeat(Sample::idle(LineState::DPlus, false));
    let mut stream = capture.start_capture(Speed::Full, quiet)?;

    match stream.poll_next(Duration::from_secs(10)) {
        EventPoll::Event(event) => assert_eq!(event?, TimestampedEvent::Event {
            timestamp_ns: 0,
            event_type: EventType::CaptureStartFull,
        }),
        EventPoll::Timeout => panic!("no capture start event"),
        EventPoll::Ended => panic!("capture ended by itself"),
    }

    let stats = stream.stop()?;
    assert!(stats.ticks > 0);
    assert!(stats.engine.events >= 1);
    assert!(!capture.control().state().enable());
    Ok(())
}

#[test]
fn configuration_is_checked_up_front() {
    let capture = capture(CaptureConfig::default());
    assert_eq!(capture.supported_speeds().len(), 4);
    assert_eq!(capture.settings().ring_capacity, 65536);

    let config = CaptureConfig {
        ring_capacity: Some(1000),
        ..Default::default()
    };
    assert!(Capture::new(config).is_err());
}
