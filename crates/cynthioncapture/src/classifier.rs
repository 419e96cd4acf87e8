//! Classification of bus-level events: attach, reset, suspend and resume,
//! and the high-speed detection handshake.

use tracing::debug;

use crate::event::EventType;
use crate::sample::Sample;
use crate::timing::Timings;
use crate::usb::{LineState, Signalling, Speed};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BusState {
    Initialize,
    VbusInvalid,
    Disconnect,

    LsNonReset,
    LsReset,
    LsSuspend,
    LsResume,

    FsNonReset,
    FsReset,
    FsSuspend,
    FsResume,

    HsNonReset,
    /// Fixed high speed: only VBUS is tracked.
    HsListen,

    AwaitDeviceChirpStart,
    AwaitDeviceChirpEnd,
    AwaitHostK,
    InHostK,
    AwaitHostJ,
    InHostJ,
    IsHighSpeed,
    IsLowOrFullSpeed,
    DetectHsSuspend,
}

impl BusState {
    /// States from which a loss of VBUS is reported.
    fn watches_vbus(self) -> bool {
        !matches!(self, BusState::Initialize | BusState::VbusInvalid | BusState::IsHighSpeed)
    }
}

/// Outcome of one tick of the state machine.
struct Transition {
    next: BusState,
    event: Option<EventType>,
    restart_timer: bool,
}

impl Transition {
    fn stay(state: BusState) -> Transition {
        Transition { next: state, event: None, restart_timer: false }
    }

    fn to(next: BusState, event: Option<EventType>) -> Transition {
        Transition { next, event, restart_timer: false }
    }

    fn restarting_timer(mut self) -> Transition {
        self.restart_timer = true;
        self
    }
}

/// Line conditions seen on one tick.
struct Line {
    state: LineState,
    last: LineState,
    changed: bool,
    /// Ticks the current line state has been held in the current bus
    /// state, not counting this one.
    held: u32,
    /// How long the previous state lasted, valid on the tick of a change.
    previous_duration: u32,
}

impl Line {
    fn is(&self, state: LineState) -> bool {
        self.state == state
    }

    /// `state` has been held for at least `cycles`.
    fn held(&self, state: LineState, cycles: u32) -> bool {
        self.state == state && self.held >= cycles
    }

    /// The bus just returned to `idle` after an SE0 pulse of valid length.
    fn ends_pulse(&self, idle: LineState, timings: &Timings) -> bool {
        self.changed
            && self.state == idle
            && self.last == LineState::Se0
            && timings.is_pulse(self.previous_duration)
    }
}

pub struct BusEventClassifier {
    timings: Timings,
    mode: Speed,
    state: BusState,
    /// Ticks since the last timer restart.
    timer: u32,
    last_line_state: LineState,
    /// Restarted on every line or bus state change, so a threshold is only
    /// met by time spent in the state that checks it.
    line_state_time: u32,
    vbus_high_time: u32,
    valid_pairs: u8,
    was_high_speed: bool,
    detected_speed: Speed,
    phy_speed: Speed,
}

impl BusEventClassifier {
    /// Create a classifier for the given speed setting; `Speed::Auto`
    /// enables speed detection.
    pub fn new(timings: Timings, mode: Speed) -> BusEventClassifier {
        BusEventClassifier {
            timings,
            mode,
            state: BusState::Initialize,
            timer: 0,
            last_line_state: LineState::Se0,
            line_state_time: 0,
            vbus_high_time: 0,
            valid_pairs: 0,
            was_high_speed: false,
            detected_speed: Speed::Auto,
            phy_speed: Speed::Full,
        }
    }

    /// Switch speed setting, restarting classification.
    pub fn reconfigure(&mut self, mode: Speed) {
        *self = BusEventClassifier::new(self.timings, mode);
    }

    pub fn mode(&self) -> Speed {
        self.mode
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// The last speed reported by a speed detection event.
    pub fn detected_speed(&self) -> Speed {
        self.detected_speed
    }

    /// The speed the PHY should be receiving at.
    pub fn phy_speed(&self) -> Speed {
        self.phy_speed
    }

    /// Advance one tick, returning the event classified on it, if any.
    pub fn step(&mut self, sample: &Sample) -> Option<EventType> {
        let changed = sample.line_state != self.last_line_state;
        let line = Line {
            state: sample.line_state,
            last: self.last_line_state,
            changed,
            held: if changed { 0 } else { self.line_state_time.saturating_add(1) },
            previous_duration: self.line_state_time.saturating_add(1),
        };

        let mut event = None;
        if line.changed {
            if let Some(signalling) = self.watched_signalling(&line) {
                event = Some(signalling.event(line.state));
            }
        }

        let transition = self.transition(sample, &line);
        if transition.event.is_some() {
            event = transition.event;
        }

        // A speed change waits for a tick with nothing else to report.
        if let Some(speed) = self.wanted_speed(transition.next) {
            if speed != self.detected_speed && event.is_none() {
                self.detected_speed = speed;
                event = Some(EventType::speed_detect(speed));
            }
        }

        self.line_state_time = line.held;
        if transition.next != self.state {
            debug!(from = ?self.state, to = ?transition.next, "Bus state change");
            self.state = transition.next;
            self.line_state_time = 0;
        }
        self.timer = if transition.restart_timer { 0 } else { self.timer.saturating_add(1) };
        self.last_line_state = line.state;
        self.vbus_high_time = if sample.vbus_present {
            self.vbus_high_time.saturating_add(1)
        } else {
            0
        };
        event
    }

    fn auto(&self) -> bool {
        self.mode == Speed::Auto
    }

    /// The signalling used to report line state changes in the current
    /// state, or `None` if line states aren't reported.
    fn watched_signalling(&self, line: &Line) -> Option<Signalling> {
        use BusState::*;
        let low_or_full = if line.is(LineState::DMinus) { Signalling::Low } else { Signalling::Full };
        match self.state {
            Disconnect => Some(match self.mode {
                Speed::Low => Signalling::Low,
                Speed::Full => Signalling::Full,
                _ => low_or_full,
            }),
            IsLowOrFullSpeed => Some(low_or_full),
            LsReset if self.auto() && line.is(LineState::DPlus) => Some(Signalling::Full),
            LsReset | LsSuspend | LsResume => Some(Signalling::Low),
            FsReset | FsSuspend | FsResume => Some(Signalling::Full),
            AwaitDeviceChirpStart | AwaitDeviceChirpEnd | AwaitHostK | InHostK | AwaitHostJ
            | InHostJ => Some(Signalling::Chirp),
            _ => None,
        }
    }

    /// The speed reported while in `state` during speed detection.
    fn wanted_speed(&self, state: BusState) -> Option<Speed> {
        use BusState::*;
        if !self.auto() {
            return None;
        }
        match state {
            VbusInvalid | Disconnect => Some(Speed::Auto),
            LsNonReset => Some(Speed::Low),
            FsNonReset => Some(Speed::Full),
            IsHighSpeed | HsNonReset => Some(Speed::High),
            _ => None,
        }
    }

    fn transition(&mut self, sample: &Sample, line: &Line) -> Transition {
        use BusState::*;
        use LineState::{DMinus, DPlus, Se0};

        if !sample.vbus_present && self.state.watches_vbus() {
            self.phy_speed = Speed::Full;
            return Transition::to(VbusInvalid, Some(EventType::VbusInvalid));
        }

        let t = self.timings;
        let auto = self.auto();
        // Full and high speed J is D+; low speed J is D-.
        let fs_idle = Signalling::Full.idle();
        let ls_idle = Signalling::Low.idle();

        match self.state {
            Initialize => {
                self.phy_speed = Speed::Full;
                Transition::to(self.powered_state(sample.vbus_present), None)
            }

            VbusInvalid => {
                if self.vbus_high_time >= t.vbus_debounce {
                    Transition::to(self.powered_state(true), Some(EventType::VbusValid))
                } else {
                    Transition::stay(VbusInvalid)
                }
            }

            Disconnect => {
                let full = auto || self.mode == Speed::Full;
                let low = auto || self.mode == Speed::Low;
                if full && line.held(fs_idle, t.reset) {
                    Transition::to(FsNonReset, Some(EventType::FsAttach))
                } else if low && line.held(ls_idle, t.reset) {
                    self.ls_attach()
                } else {
                    Transition::stay(Disconnect)
                }
            }

            LsNonReset => {
                if line.held(Se0, t.reset) {
                    Transition::to(LsReset, Some(EventType::BusReset))
                } else if line.held(ls_idle, t.suspend) {
                    Transition::to(LsSuspend, Some(EventType::Suspend))
                } else if line.ends_pulse(ls_idle, &t) {
                    Transition::to(LsNonReset, Some(EventType::LsKeepalive))
                } else {
                    Transition::stay(LsNonReset)
                }
            }

            LsReset => {
                if auto {
                    // An FS idle after an LS reset is a new full-speed device.
                    if line.held(DPlus, t.reset) {
                        self.phy_speed = Speed::Full;
                        Transition::to(FsNonReset, Some(EventType::FsAttach))
                    } else if line.is(ls_idle) {
                        Transition::to(LsNonReset, None)
                    } else {
                        Transition::stay(LsReset)
                    }
                } else if line.is(ls_idle) {
                    Transition::to(LsNonReset, None)
                } else {
                    Transition::stay(LsReset)
                }
            }

            LsSuspend => {
                let resume = Signalling::Low.resume();
                if line.held(Se0, t.reset) {
                    if auto {
                        self.enter_fs_reset()
                    } else {
                        Transition::to(LsReset, Some(EventType::BusReset))
                    }
                } else if auto && line.is(resume) {
                    Transition::to(LsNonReset, Some(EventType::Resume))
                } else if !auto && line.held(resume, t.resume) {
                    Transition::to(LsResume, Some(EventType::Resume))
                } else {
                    Transition::stay(LsSuspend)
                }
            }

            LsResume => {
                if line.held(Se0, t.reset) {
                    Transition::to(LsReset, Some(EventType::BusReset))
                } else if line.ends_pulse(ls_idle, &t) {
                    Transition::to(LsNonReset, None)
                } else {
                    Transition::stay(LsResume)
                }
            }

            FsNonReset => {
                let mut next = if line.held(Se0, t.reset) {
                    if auto {
                        self.enter_fs_reset()
                    } else {
                        Transition::to(FsReset, Some(EventType::BusReset))
                    }
                } else if line.held(fs_idle, t.suspend) {
                    self.was_high_speed = false;
                    Transition::to(FsSuspend, Some(EventType::Suspend))
                } else {
                    Transition::stay(FsNonReset)
                };
                if next.event.is_none() && line.changed {
                    if line.is(Se0) {
                        next.event = Some(EventType::LinestateSe0);
                    } else if !auto && line.is(fs_idle) && line.last == Se0 {
                        next.event = Some(EventType::LinestateFsJ);
                    }
                }
                next
            }

            FsReset => {
                if line.is(fs_idle) {
                    Transition::to(FsNonReset, None)
                } else {
                    Transition::stay(FsReset)
                }
            }

            FsSuspend => {
                let resume = Signalling::Full.resume();
                if line.held(Se0, t.reset) {
                    if auto {
                        self.enter_fs_reset()
                    } else {
                        Transition::to(FsReset, Some(EventType::BusReset))
                    }
                } else if auto && line.is(resume) {
                    let next = if self.was_high_speed { IsHighSpeed } else { FsNonReset };
                    Transition::to(next, Some(EventType::Resume))
                } else if !auto && line.held(resume, t.resume) {
                    Transition::to(FsResume, Some(EventType::Resume))
                } else {
                    Transition::stay(FsSuspend)
                }
            }

            FsResume => {
                if line.held(Se0, t.reset) {
                    Transition::to(FsReset, Some(EventType::BusReset))
                } else if line.ends_pulse(fs_idle, &t) {
                    Transition::to(FsNonReset, None)
                } else {
                    Transition::stay(FsResume)
                }
            }

            HsNonReset => {
                // Squelch reads as SE0; after 3 ms switch to FS to find out
                // whether this is a reset or a suspend.
                if line.held(Se0, t.suspend) {
                    self.phy_speed = Speed::Full;
                    Transition::to(DetectHsSuspend, None).restarting_timer()
                } else {
                    Transition::stay(HsNonReset)
                }
            }

            HsListen => Transition::stay(HsListen),

            AwaitDeviceChirpStart => {
                if self.timer >= t.device_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else if line.held(DMinus, t.reset) {
                    Transition::to(AwaitDeviceChirpEnd, Some(EventType::DeviceChirpValid))
                } else {
                    Transition::stay(AwaitDeviceChirpStart)
                }
            }

            AwaitDeviceChirpEnd => {
                if self.timer >= t.device_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else if !line.is(DMinus) {
                    Transition::to(AwaitHostK, None).restarting_timer()
                } else {
                    Transition::stay(AwaitDeviceChirpEnd)
                }
            }

            AwaitHostK => {
                if line.is(DMinus) {
                    Transition::to(InHostK, None)
                } else if self.timer >= t.host_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else {
                    Transition::stay(AwaitHostK)
                }
            }

            InHostK => {
                if self.timer >= t.host_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else if !line.is(DMinus) {
                    Transition::to(AwaitHostK, None)
                } else if line.held >= t.reset {
                    Transition::to(AwaitHostJ, None)
                } else {
                    Transition::stay(InHostK)
                }
            }

            AwaitHostJ => {
                if line.is(DPlus) {
                    Transition::to(InHostJ, None)
                } else if self.timer >= t.host_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else {
                    Transition::stay(AwaitHostJ)
                }
            }

            InHostJ => {
                if self.timer >= t.host_chirp_timeout {
                    Transition::to(IsLowOrFullSpeed, None)
                } else if !line.is(DPlus) {
                    Transition::to(AwaitHostJ, None)
                } else if line.held >= t.reset {
                    if self.valid_pairs == 2 {
                        Transition::to(IsHighSpeed, Some(EventType::HostChirpValid))
                    } else {
                        self.valid_pairs += 1;
                        Transition::to(AwaitHostK, None)
                    }
                } else {
                    Transition::stay(InHostJ)
                }
            }

            IsHighSpeed => {
                self.phy_speed = Speed::High;
                Transition::to(HsNonReset, None)
            }

            IsLowOrFullSpeed => {
                if line.is(fs_idle) {
                    Transition::to(FsNonReset, None)
                } else if line.held(ls_idle, t.reset) {
                    self.ls_attach()
                } else {
                    Transition::stay(IsLowOrFullSpeed)
                }
            }

            DetectHsSuspend => {
                if self.timer < t.hs_suspend_settle {
                    Transition::stay(DetectHsSuspend)
                } else if line.is(fs_idle) {
                    self.was_high_speed = true;
                    Transition::to(FsSuspend, Some(EventType::Suspend))
                } else {
                    self.enter_fs_reset()
                }
            }
        }
    }

    /// Where to go once VBUS is known.
    fn powered_state(&self, vbus_present: bool) -> BusState {
        match (vbus_present, self.mode) {
            (false, _) => BusState::VbusInvalid,
            (true, Speed::High) => BusState::HsListen,
            (true, _) => BusState::Disconnect,
        }
    }

    fn ls_attach(&mut self) -> Transition {
        self.phy_speed = Speed::Low;
        Transition::to(BusState::LsNonReset, Some(EventType::LsAttach))
    }

    /// A full-speed reset in auto mode starts the high-speed handshake.
    fn enter_fs_reset(&mut self) -> Transition {
        self.phy_speed = Speed::Full;
        self.valid_pairs = 0;
        Transition::to(BusState::AwaitDeviceChirpStart, Some(EventType::BusReset))
            .restarting_timer()
    }
}
