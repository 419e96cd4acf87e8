use cynthioncapture::classifier::BusState;
use cynthioncapture::timing::Timings;
use cynthioncapture::{BusEventClassifier, EventType, LineState, SampleScript, Speed};

use EventType::*;
use LineState::*;

fn classify(classifier: &mut BusEventClassifier, script: SampleScript) -> Vec<EventType> {
    script.into_iter().filter_map(|sample| classifier.step(&sample)).collect()
}

fn full_speed_device() -> BusEventClassifier {
    let mut classifier = BusEventClassifier::new(Timings::reference(), Speed::Auto);
    let events = classify(&mut classifier, SampleScript::new().line(DPlus, 400));
    assert_eq!(events, vec![FsAttach, SpeedDetectFull]);
    classifier
}

/// Reset, device chirp, then three host K-J pairs.
fn chirp_handshake() -> SampleScript {
    let mut script = SampleScript::new()
        .line(Se0, 200)
        .line(DMinus, 60_000)
        .line(Se0, 100);
    for _ in 0..3 {
        script = script.line(DMinus, 3_000).line(DPlus, 3_000);
    }
    script
}

fn high_speed_device() -> BusEventClassifier {
    let mut classifier = full_speed_device();
    classify(&mut classifier, chirp_handshake());
    assert_eq!(classifier.state(), BusState::HsNonReset);
    classifier
}

#[test]
fn chirp_handshake_detects_high_speed() {
    let mut classifier = full_speed_device();
    let events = classify(&mut classifier, chirp_handshake());
    assert_eq!(events, vec![
        LinestateSe0,
        BusReset,
        LinestateChirpK,
        DeviceChirpValid,
        LinestateSe0,
        LinestateChirpK,
        LinestateChirpJ,
        LinestateChirpK,
        LinestateChirpJ,
        LinestateChirpK,
        LinestateChirpJ,
        HostChirpValid,
        SpeedDetectHigh,
    ]);
    assert_eq!(classifier.state(), BusState::HsNonReset);
    assert_eq!(classifier.phy_speed(), Speed::High);
    assert_eq!(classifier.detected_speed(), Speed::High);
}

#[test]
fn high_speed_suspend_and_resume() {
    let mut classifier = high_speed_device();
    let script = SampleScript::new()
        .line(Se0, 180_010)
        .line(DPlus, 12_010)
        .line(DMinus, 10);
    let events = classify(&mut classifier, script);
    // Resuming returns straight to high speed, without a new detection.
    assert_eq!(events, vec![Suspend, Resume]);
    assert_eq!(classifier.state(), BusState::HsNonReset);
    assert_eq!(classifier.phy_speed(), Speed::High);
}

#[test]
fn high_speed_reset_restarts_handshake() {
    let mut classifier = high_speed_device();
    let script = SampleScript::new().line(Se0, 180_000 + 12_010);
    let events = classify(&mut classifier, script);
    assert_eq!(events, vec![BusReset]);
    assert_eq!(classifier.state(), BusState::AwaitDeviceChirpStart);
    assert_eq!(classifier.phy_speed(), Speed::Full);
}

#[test]
fn low_speed_device_is_reported_once() {
    let mut classifier = BusEventClassifier::new(Timings::reference(), Speed::Auto);
    let events = classify(&mut classifier, SampleScript::new().line(DMinus, 1_000));
    assert_eq!(events, vec![LsAttach, SpeedDetectLow]);

    let script = SampleScript::new().line(Se0, 200).line(DMinus, 1_000);
    let events = classify(&mut classifier, script);
    assert_eq!(events, vec![BusReset, LinestateLsJ]);
    assert_eq!(classifier.state(), BusState::LsNonReset);
    assert_eq!(classifier.detected_speed(), Speed::Low);
}

#[test]
fn disconnect_on_vbus_loss() {
    let mut classifier = high_speed_device();
    let events = classify(&mut classifier, SampleScript::new().vbus(false).idle(10));
    assert_eq!(events, vec![VbusInvalid, SpeedDetectAuto]);
    assert_eq!(classifier.phy_speed(), Speed::Full);

    let events = classify(&mut classifier, SampleScript::new().idle(3_001));
    assert_eq!(events, vec![VbusValid]);
    assert_eq!(classifier.state(), BusState::Disconnect);
}

#[test]
fn scaled_timings_follow_clock() {
    let timings = Timings::for_clock(30_000_000).unwrap();
    let mut classifier = BusEventClassifier::new(timings, Speed::Auto);
    let events = classify(&mut classifier, SampleScript::new().line(DPlus, 74));
    assert!(events.is_empty());
    let events = classify(&mut classifier, SampleScript::new().idle(2));
    assert_eq!(events, vec![FsAttach]);
}
