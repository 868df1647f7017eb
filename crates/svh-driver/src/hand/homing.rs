//! Homing state machine
//!
//! Pure supervision logic for one channel: it decides where the channel should
//! be commanded next and when a phase is complete, from feedback samples and
//! timestamps handed in by the caller. The manager owns the I/O loop.
//!
//! Phases: `Idle -> DrivingToHardStop -> HardStopFound -> DrivingToIdle ->
//! Homed | Failed`.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::calibration::ChannelCalibration;
use super::feedback::ControllerFeedback;
use super::settings::{CurrentSettings, Direction, HomeSettings};

/// Net threshold crossings needed to accept a hard stop
pub const HARD_STOP_HITS: u32 = 10;

/// Opposing current that marks a deadlock [mA]
pub const DEADLOCK_THRESHOLD_MA: i32 = 80;

/// How close the idle drive must get to the park position [ticks]
pub const IDLE_TOLERANCE: i32 = 1_000;

/// Command magnitude used to push a channel into its stop [ticks]
const HARD_STOP_TARGET: i32 = 1_000_000;

/// Per-channel health gathered during homing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticState {
    /// Encoder reported movement
    pub encoder_ok: bool,
    /// Current reached the hard-stop threshold
    pub current_controller_ok: bool,
    /// Lowest current seen [mA]
    pub current_min: i16,
    /// Highest current seen [mA]
    pub current_max: i16,
    /// Lowest position seen [ticks]
    pub position_min: i32,
    /// Highest position seen [ticks]
    pub position_max: i32,
    /// Peak current against the direction of travel during the hard-stop
    /// drive, recorded once it exceeds [`DEADLOCK_THRESHOLD_MA`] [mA]; 0 if none.
    /// This is the absolute opposing current, not an excursion past an extreme.
    pub deadlock: i32,
}

impl DiagnosticState {
    fn record(&mut self, feedback: ControllerFeedback, first: bool) {
        if first {
            self.current_min = feedback.current;
            self.current_max = feedback.current;
            self.position_min = feedback.position;
            self.position_max = feedback.position;
            return;
        }
        self.current_min = self.current_min.min(feedback.current);
        self.current_max = self.current_max.max(feedback.current);
        self.position_min = self.position_min.min(feedback.position);
        self.position_max = self.position_max.max(feedback.position);
        self.encoder_ok = self.position_max != self.position_min;
    }
}

/// Homing phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingPhase {
    /// Not started
    Idle,
    /// Pushing towards the mechanical stop at reduced speed
    DrivingToHardStop,
    /// Stop detected, limits known
    HardStopFound,
    /// Moving to the park position
    DrivingToIdle,
    Homed,
    Failed,
}

/// Why a homing run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomingFailure {
    /// Position stopped changing before a hard stop was detected
    Stalled,
    /// The park position was not reached in time
    IdleNotReached,
}

/// One homing attempt of one channel
#[derive(Debug, Clone)]
pub struct HomingRun {
    home: HomeSettings,
    threshold: f64,
    timeout: Duration,
    phase: HomingPhase,
    hits: u32,
    samples: u32,
    last_position: Option<i32>,
    last_motion: Instant,
    idle_started: Instant,
    hard_stop: Option<i32>,
    calibration: Option<ChannelCalibration>,
    diagnostics: DiagnosticState,
    failure: Option<HomingFailure>,
}

impl HomingRun {
    /// Start driving towards the hard stop.
    ///
    /// The hit threshold is `reset_current_factor` times the current limiter
    /// bound on the side the channel travels to.
    pub fn start(
        home: HomeSettings,
        current: &CurrentSettings,
        timeout: Duration,
        now: Instant,
    ) -> Self {
        let bound = match home.direction {
            Direction::Positive => current.wmx,
            Direction::Negative => current.wmn,
        };
        Self {
            threshold: home.reset_current_factor * bound as f64,
            home,
            timeout,
            phase: HomingPhase::DrivingToHardStop,
            hits: 0,
            samples: 0,
            last_position: None,
            last_motion: now,
            idle_started: now,
            hard_stop: None,
            calibration: None,
            diagnostics: DiagnosticState::default(),
            failure: None,
        }
    }

    pub fn phase(&self) -> HomingPhase {
        self.phase
    }

    /// Current net hit count
    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Position to command in the current phase, if any
    pub fn target(&self) -> Option<i32> {
        match self.phase {
            HomingPhase::DrivingToHardStop => Some(self.home.direction.sign() * HARD_STOP_TARGET),
            HomingPhase::HardStopFound | HomingPhase::DrivingToIdle => {
                self.calibration.map(|c| c.position_home)
            }
            _ => None,
        }
    }

    /// Feed one feedback sample and return the resulting phase
    pub fn step(&mut self, feedback: ControllerFeedback, now: Instant) -> HomingPhase {
        match self.phase {
            HomingPhase::DrivingToHardStop => self.step_hard_stop(feedback, now),
            HomingPhase::DrivingToIdle => self.step_idle(feedback, now),
            _ => {}
        }
        self.phase
    }

    fn step_hard_stop(&mut self, feedback: ControllerFeedback, now: Instant) {
        self.diagnostics.record(feedback, self.samples == 0);
        self.samples += 1;

        let current = feedback.current as f64;
        let hit = match self.home.direction {
            Direction::Positive => current >= self.threshold,
            Direction::Negative => current <= self.threshold,
        };
        if hit {
            self.hits += 1;
        } else {
            self.hits = self.hits.saturating_sub(1);
        }

        let opposing = -self.home.direction.sign() * feedback.current as i32;
        if opposing > DEADLOCK_THRESHOLD_MA {
            self.diagnostics.deadlock = self.diagnostics.deadlock.max(opposing);
        }

        if self.hits >= HARD_STOP_HITS {
            self.diagnostics.current_controller_ok = true;
            self.hard_stop = Some(feedback.position);
            self.calibration = Some(ChannelCalibration::from_hard_stop(
                feedback.position,
                &self.home,
            ));
            self.phase = HomingPhase::HardStopFound;
            return;
        }

        if self.last_position != Some(feedback.position) {
            self.last_position = Some(feedback.position);
            self.last_motion = now;
        } else if now.duration_since(self.last_motion) > self.timeout {
            self.failure = Some(HomingFailure::Stalled);
            self.phase = HomingPhase::Failed;
        }
    }

    /// Switch from the found hard stop to the park position drive
    pub fn begin_drive_to_idle(&mut self, now: Instant) {
        if self.phase == HomingPhase::HardStopFound {
            self.idle_started = now;
            self.phase = HomingPhase::DrivingToIdle;
        }
    }

    fn step_idle(&mut self, feedback: ControllerFeedback, now: Instant) {
        let Some(home) = self.calibration.map(|c| c.position_home) else {
            self.phase = HomingPhase::Failed;
            return;
        };
        if (feedback.position as i64 - home as i64).abs() < IDLE_TOLERANCE as i64 {
            self.phase = HomingPhase::Homed;
        } else if now.duration_since(self.idle_started) > self.timeout {
            self.failure = Some(HomingFailure::IdleNotReached);
            self.phase = HomingPhase::Failed;
        }
    }

    /// Position where the hard stop was detected [ticks]
    pub fn hard_stop(&self) -> Option<i32> {
        self.hard_stop
    }

    /// Limits found at the hard stop
    pub fn calibration(&self) -> Option<ChannelCalibration> {
        self.calibration
    }

    pub fn diagnostics(&self) -> DiagnosticState {
        self.diagnostics
    }

    pub fn failure(&self) -> Option<HomingFailure> {
        self.failure
    }
}
