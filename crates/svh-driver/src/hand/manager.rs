//! Hand manager
//!
//! Public control surface of the driver. Positions are exchanged in radians
//! and only accepted for homed channels within their soft limits. Every
//! operation reports failure through its return value and logs the reason.
//!
//! Channels listed as switched off in the configuration are never driven but
//! report themselves homed and enabled, so callers can treat a partially
//! equipped hand like a complete one.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, field, info, info_span, warn, Span};

use super::calibration::{current_settings_are_safe, ChannelCalibration};
use super::controller::Controller;
use super::feedback::{ControllerFeedback, FirmwareInfo};
use super::homing::{DiagnosticState, HomingPhase, HomingRun};
use super::poller::FeedbackPoller;
use super::settings::{CurrentSettings, HomeSettings, PositionSettings};
use super::{Channel, ChannelSelect, CHANNEL_COUNT, RESET_ORDER};
use crate::config::{ConfigError, HandConfig};
use crate::protocol::{ByteTransport, ProtocolError, ReceiverStats, SerialTransport};

/// Extra homing attempts per channel when resetting all channels
pub const MAX_RESET_RETRIES: u32 = 3;

/// How long `get_firmware_info` waits for an answer
const FIRMWARE_WAIT: Duration = Duration::from_millis(100);

/// Poll period while waiting on the link
const WAIT_SLICE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, Default)]
struct ChannelRuntime {
    switched_off: bool,
    homed: bool,
    hard_stop: Option<i32>,
    calibration: Option<ChannelCalibration>,
    diagnostics: DiagnosticState,
}

enum Handshake {
    Synced,
    Silent,
    Partial { transmitted: u32, received: u32 },
}

/// Control interface of one SVH hand
pub struct HandManager {
    controller: Arc<Controller>,
    config: HandConfig,
    channels: [ChannelRuntime; CHANNEL_COUNT],
    home_settings: [HomeSettings; CHANNEL_COUNT],
    position_settings: [PositionSettings; CHANNEL_COUNT],
    current_settings: [CurrentSettings; CHANNEL_COUNT],
    /// Scale applied to current limits sent to the board
    force: f64,
    poller: Option<FeedbackPoller>,
    connected: bool,
    span: Span,
}

impl HandManager {
    /// Create a manager on `transport`. Nothing is opened until `connect`.
    pub fn new(transport: Box<dyn ByteTransport>, config: HandConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let switched_off = config.switched_off()?;

        let span = info_span!("svh_hand", path = field::Empty);
        let controller = Arc::new(Controller::new(transport, config.interface(), span.clone()));

        let mut channels = [ChannelRuntime::default(); CHANNEL_COUNT];
        for (runtime, off) in channels.iter_mut().zip(switched_off) {
            runtime.switched_off = off;
            runtime.homed = off;
        }

        let home_settings = Channel::ALL.map(|c| {
            config.home_settings.get(&c).copied().unwrap_or_else(|| HomeSettings::default_for(c))
        });
        let position_settings = Channel::ALL.map(|c| {
            config
                .position_settings
                .get(&c)
                .copied()
                .unwrap_or_else(|| PositionSettings::default_for(c))
        });
        let current_settings = Channel::ALL.map(|c| {
            config
                .current_settings
                .get(&c)
                .copied()
                .unwrap_or_else(|| CurrentSettings::default_for(c))
        });

        Ok(Self {
            controller,
            config,
            channels,
            home_settings,
            position_settings,
            current_settings,
            force: 1.0,
            poller: None,
            connected: false,
            span,
        })
    }

    /// Create a manager talking to a real serial port
    pub fn with_serial(config: HandConfig) -> Result<Self, ConfigError> {
        Self::new(Box::new(SerialTransport::new()), config)
    }

    pub fn config(&self) -> &HandConfig {
        &self.config
    }

    /// Protocol-level access to the board
    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    // Connection

    /// Connect using the configured number of retries
    pub fn connect(&mut self, path: &str) -> bool {
        self.connect_with_retries(path, self.config.connect_retries)
    }

    /// Open `path`, install settings and wait for the board to answer.
    ///
    /// An attempt succeeds once every sent frame has been answered. When some
    /// answers are missing the attempt is repeated up to `retries` times; when
    /// nothing at all comes back the link is presumed absent and no retry is
    /// made.
    pub fn connect_with_retries(&mut self, path: &str, retries: u32) -> bool {
        if self.connected {
            self.disconnect();
        }
        self.span.record("path", path);
        let span = self.span.clone();
        let _enter = span.enter();

        if let Err(e) = self.controller.connect(path) {
            error!(target: "svh::manager", "could not open {path}: {e}");
            return false;
        }

        let mut synced = false;
        for attempt in 0..=retries {
            self.controller.reset_counters();
            match self.handshake() {
                Ok(Handshake::Synced) => {
                    synced = true;
                    break;
                }
                Ok(Handshake::Silent) => {
                    error!(target: "svh::manager", "no answer from the hand, giving up");
                    break;
                }
                Ok(Handshake::Partial { transmitted, received }) => {
                    warn!(
                        target: "svh::manager",
                        attempt, transmitted, received,
                        "handshake incomplete"
                    );
                }
                Err(e) => {
                    error!(target: "svh::manager", "handshake failed: {e}");
                    break;
                }
            }
        }

        if !synced {
            self.controller.disconnect();
            return false;
        }

        match FeedbackPoller::start(
            Arc::clone(&self.controller),
            self.config.poll_interval(),
            self.span.clone(),
        ) {
            Ok(poller) => self.poller = Some(poller),
            Err(e) => {
                error!(target: "svh::manager", "could not start feedback poller: {e}");
                self.controller.disconnect();
                return false;
            }
        }
        self.connected = true;

        if let Err(e) = self.controller.request_firmware_info() {
            warn!(target: "svh::manager", "firmware info request failed: {e}");
        }
        info!(target: "svh::manager", path, "hand connected");
        true
    }

    fn handshake(&self) -> Result<Handshake, ProtocolError> {
        self.controller.disable_all()?;
        for channel in Channel::ALL {
            self.controller
                .set_position_settings(channel, self.position_settings[channel.index()])?;
            self.controller
                .set_current_settings(channel, self.board_current_settings(channel))?;
        }
        for channel in Channel::ALL {
            self.controller.request_feedback(channel)?;
        }

        let deadline = Instant::now() + self.config.connect_timeout();
        loop {
            let transmitted = self.controller.transmitted_count();
            let received = self.controller.received_count();
            if transmitted == received {
                return Ok(Handshake::Synced);
            }
            if Instant::now() >= deadline {
                return Ok(if received == 0 {
                    Handshake::Silent
                } else {
                    Handshake::Partial { transmitted, received }
                });
            }
            thread::sleep(WAIT_SLICE);
        }
    }

    /// Power down, stop background work and close the link.
    ///
    /// Homing results and diagnostics are kept for the next connection.
    pub fn disconnect(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        if self.connected {
            if let Err(e) = self.controller.disable_all() {
                warn!(target: "svh::manager", "could not disable channels: {e}");
            }
            info!(target: "svh::manager", "hand disconnected");
        }
        self.controller.disconnect();
        self.connected = false;
    }

    pub fn is_connected(&self) -> bool {
        self.connected && self.controller.is_connected()
    }

    // Homing

    /// Home one channel, or all of them in [`RESET_ORDER`].
    ///
    /// Blocks until done. Resetting all channels retries each failing
    /// channel up to [`MAX_RESET_RETRIES`] times and succeeds only if every
    /// channel does.
    pub fn reset_channel(&mut self, select: ChannelSelect) -> bool {
        let span = self.span.clone();
        let _enter = span.enter();

        match select {
            ChannelSelect::One(channel) => self.reset_single(channel),
            ChannelSelect::All => {
                let mut all_ok = true;
                for channel in RESET_ORDER {
                    let mut ok = false;
                    for attempt in 0..=MAX_RESET_RETRIES {
                        if attempt > 0 {
                            warn!(target: "svh::homing", %channel, attempt, "retrying reset");
                        }
                        if self.reset_single(channel) {
                            ok = true;
                            break;
                        }
                    }
                    if !ok {
                        error!(target: "svh::homing", %channel, "giving up on channel");
                        all_ok = false;
                    }
                }
                all_ok
            }
        }
    }

    fn reset_single(&mut self, channel: Channel) -> bool {
        let index = channel.index();
        if self.channels[index].switched_off {
            self.channels[index].homed = true;
            debug!(target: "svh::homing", %channel, "switched off, nothing to home");
            return true;
        }
        if !self.is_connected() {
            error!(target: "svh::homing", %channel, "cannot reset while disconnected");
            return false;
        }

        self.channels[index].homed = false;
        info!(target: "svh::homing", %channel, "homing started");

        let result = self.drive_home(channel);

        // Leave the channel unpowered at normal speed whatever happened
        let restore = self
            .controller
            .set_position_settings(channel, self.position_settings[index])
            .and_then(|_| self.controller.disable_channel(channel));
        if let Err(e) = restore {
            warn!(target: "svh::homing", %channel, "could not restore channel: {e}");
        }

        match result {
            Ok(run) => {
                let runtime = &mut self.channels[index];
                runtime.diagnostics = run.diagnostics();
                if run.calibration().is_some() {
                    runtime.calibration = run.calibration();
                    runtime.hard_stop = run.hard_stop();
                }
                if run.phase() == HomingPhase::Homed {
                    runtime.homed = true;
                    info!(target: "svh::homing", %channel, "homing finished");
                    true
                } else {
                    error!(
                        target: "svh::homing",
                        %channel,
                        reason = ?run.failure(),
                        "homing failed"
                    );
                    false
                }
            }
            Err(e) => {
                error!(target: "svh::homing", %channel, "homing aborted: {e}");
                false
            }
        }
    }

    fn drive_home(&self, channel: Channel) -> Result<HomingRun, ProtocolError> {
        let index = channel.index();
        let current = self.board_current_settings(channel);
        let slow = self.position_settings[index].with_speed_factor(self.config.reset_speed_factor);

        self.controller.set_current_settings(channel, current)?;
        self.controller.set_position_settings(channel, slow)?;
        self.controller.enable_channel(channel)?;

        let cycle = self.config.homing_cycle();
        let mut run = HomingRun::start(
            self.home_settings[index],
            &current,
            self.config.homing_timeout(),
            Instant::now(),
        );
        while let Some(target) = run.target() {
            self.controller.set_control_command(channel, target)?;
            thread::sleep(cycle);

            match run.step(self.controller.feedback(channel), Instant::now()) {
                HomingPhase::HardStopFound => {
                    debug!(
                        target: "svh::homing",
                        %channel,
                        position = self.controller.feedback(channel).position,
                        "hard stop found"
                    );
                    self.controller
                        .set_position_settings(channel, self.position_settings[index])?;
                    run.begin_drive_to_idle(Instant::now());
                }
                HomingPhase::Homed | HomingPhase::Failed => break,
                _ => {}
            }
        }
        Ok(run)
    }

    // Enabling

    /// Power up a homed channel, or all channels in reset order
    pub fn enable_channel(&self, select: ChannelSelect) -> bool {
        match select {
            ChannelSelect::All => RESET_ORDER
                .iter()
                .fold(true, |ok, channel| self.enable_channel(ChannelSelect::One(*channel)) && ok),
            ChannelSelect::One(channel) => {
                let runtime = &self.channels[channel.index()];
                if runtime.switched_off {
                    return true;
                }
                if !self.is_connected() {
                    error!(target: "svh::manager", %channel, "cannot enable while disconnected");
                    return false;
                }
                if !runtime.homed {
                    error!(target: "svh::manager", %channel, "channel must be homed before enabling");
                    return false;
                }
                if self.controller.is_enabled(channel) {
                    return true;
                }
                match self.controller.enable_channel(channel) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(target: "svh::manager", %channel, "enable failed: {e}");
                        false
                    }
                }
            }
        }
    }

    /// Power down a channel or all channels
    pub fn disable_channel(&self, select: ChannelSelect) {
        if !self.is_connected() {
            return;
        }
        let result = match select {
            ChannelSelect::All => self.controller.disable_all(),
            ChannelSelect::One(channel) if self.channels[channel.index()].switched_off => Ok(()),
            ChannelSelect::One(channel) => self.controller.disable_channel(channel),
        };
        if let Err(e) = result {
            error!(target: "svh::manager", "disable failed: {e}");
        }
    }

    // Positions

    /// Validate a target angle and convert it to ticks
    fn target_ticks(&self, channel: Channel, position_rad: f64) -> Option<i32> {
        let runtime = &self.channels[channel.index()];
        let calibration = match runtime.calibration {
            Some(calibration) if runtime.homed => calibration,
            _ => {
                warn!(target: "svh::manager", %channel, "channel is not homed");
                return None;
            }
        };
        if !position_rad.is_finite() {
            warn!(target: "svh::manager", %channel, position_rad, "target is not a number");
            return None;
        }
        let ticks = calibration.rad_to_ticks(position_rad);
        if !calibration.contains(ticks) {
            warn!(
                target: "svh::manager",
                %channel,
                position_rad,
                ticks,
                min = calibration.position_min,
                max = calibration.position_max,
                "target outside soft limits"
            );
            return None;
        }
        Some(ticks as i32)
    }

    /// Command one channel to an angle [rad]
    pub fn set_target_position(&self, channel: Channel, position_rad: f64) -> bool {
        if self.channels[channel.index()].switched_off {
            return true;
        }
        if !self.is_connected() {
            warn!(target: "svh::manager", %channel, "not connected");
            return false;
        }
        let Some(ticks) = self.target_ticks(channel, position_rad) else {
            return false;
        };
        if !self.enable_channel(ChannelSelect::One(channel)) {
            return false;
        }
        match self.controller.set_control_command(channel, ticks) {
            Ok(()) => true,
            Err(e) => {
                error!(target: "svh::manager", %channel, "position command failed: {e}");
                false
            }
        }
    }

    /// Command every channel at once [rad].
    ///
    /// Nothing is sent unless all nine targets are acceptable. Switched-off
    /// channels ignore their entry.
    pub fn set_all_target_positions(&self, positions_rad: &[f64; CHANNEL_COUNT]) -> bool {
        if !self.is_connected() {
            warn!(target: "svh::manager", "not connected");
            return false;
        }

        let mut ticks = [0i32; CHANNEL_COUNT];
        for channel in Channel::ALL {
            let index = channel.index();
            ticks[index] = if self.channels[index].switched_off {
                self.controller.feedback(channel).position
            } else {
                match self.target_ticks(channel, positions_rad[index]) {
                    Some(t) => t,
                    None => return false,
                }
            };
        }

        let was_enabled = Channel::ALL.map(|c| self.controller.is_enabled(c));
        if !self.enable_channel(ChannelSelect::All) {
            self.rollback_enable(&was_enabled);
            return false;
        }
        match self.controller.set_control_command_all(&ticks) {
            Ok(()) => true,
            Err(e) => {
                error!(target: "svh::manager", "position command failed: {e}");
                false
            }
        }
    }

    /// Power down channels that were switched on by a failed call
    fn rollback_enable(&self, was_enabled: &[bool; CHANNEL_COUNT]) {
        for channel in Channel::ALL {
            if was_enabled[channel.index()] || !self.controller.is_enabled(channel) {
                continue;
            }
            warn!(target: "svh::manager", %channel, "disabling after failed enable");
            if let Err(e) = self.controller.disable_channel(channel) {
                error!(target: "svh::manager", %channel, "disable failed: {e}");
            }
        }
    }

        /// Current angle of a channel [rad]
    pub fn get_position(&self, channel: Channel) -> Option<f64> {
        let runtime = &self.channels[channel.index()];
        if runtime.switched_off {
            return Some(0.0);
        }
        if !self.is_connected() || !runtime.homed {
            return None;
        }
        let calibration = runtime.calibration?;
        Some(calibration.position_rad(self.controller.feedback(channel).position))
    }

    /// Current motor current of a channel [mA]
    pub fn get_current(&self, channel: Channel) -> Option<f64> {
        if self.channels[channel.index()].switched_off {
            return Some(0.0);
        }
        if !self.is_connected() {
            return None;
        }
        Some(self.controller.feedback(channel).current as f64)
    }

    /// Raw feedback of a channel
    pub fn get_feedback(&self, channel: Channel) -> ControllerFeedback {
        self.controller.feedback(channel)
    }

    /// Soft limits and park position of a homed channel
    pub fn get_position_range(&self, channel: Channel) -> Option<ChannelCalibration> {
        let runtime = &self.channels[channel.index()];
        runtime.calibration.filter(|_| runtime.homed)
    }

    // State queries

    pub fn is_homed(&self, select: ChannelSelect) -> bool {
        match select {
            ChannelSelect::All => self.channels.iter().all(|r| r.homed),
            ChannelSelect::One(channel) => self.channels[channel.index()].homed,
        }
    }

    pub fn is_enabled(&self, select: ChannelSelect) -> bool {
        match select {
            ChannelSelect::All => Channel::ALL
                .iter()
                .all(|c| self.is_enabled(ChannelSelect::One(*c))),
            ChannelSelect::One(channel) => {
                self.channels[channel.index()].switched_off || self.controller.is_enabled(channel)
            }
        }
    }

    pub fn receiver_stats(&self) -> ReceiverStats {
        self.controller.receiver_stats()
    }

    // Settings

    fn board_current_settings(&self, channel: Channel) -> CurrentSettings {
        self.current_settings[channel.index()].scaled(self.force)
    }

    pub fn get_current_settings(&self, channel: Channel) -> CurrentSettings {
        self.current_settings[channel.index()]
    }

    /// Replace a channel's current settings.
    ///
    /// Once every channel is enabled the new limit is checked against the
    /// currents observed during homing.
    pub fn set_current_settings(&mut self, channel: Channel, settings: CurrentSettings) -> bool {
        let index = channel.index();
        if !current_settings_are_safe(
            self.is_enabled(ChannelSelect::All),
            &settings,
            self.config.max_current_percentage,
            &self.channels[index].diagnostics,
        ) {
            error!(
                target: "svh::manager",
                %channel,
                limit = settings.limit_magnitude(),
                "current settings exceed the safety ceiling"
            );
            return false;
        }
        self.current_settings[index] = settings;
        if !self.is_connected() || self.channels[index].switched_off {
            return true;
        }
        match self
            .controller
            .set_current_settings(channel, self.board_current_settings(channel))
        {
            Ok(()) => true,
            Err(e) => {
                error!(target: "svh::manager", %channel, "could not send current settings: {e}");
                false
            }
        }
    }

    pub fn get_position_settings(&self, channel: Channel) -> PositionSettings {
        self.position_settings[channel.index()]
    }

    /// Replace a channel's position settings
    pub fn set_position_settings(&mut self, channel: Channel, settings: PositionSettings) -> bool {
        let index = channel.index();
        self.position_settings[index] = settings;
        if !self.is_connected() || self.channels[index].switched_off {
            return true;
        }
        match self.controller.set_position_settings(channel, settings) {
            Ok(()) => true,
            Err(e) => {
                error!(target: "svh::manager", %channel, "could not send position settings: {e}");
                false
            }
        }
    }

    pub fn get_home_settings(&self, channel: Channel) -> HomeSettings {
        self.home_settings[channel.index()]
    }

    /// Replace a channel's homing settings.
    ///
    /// A homed channel gets its limits recomputed from the stored hard stop.
    pub fn set_home_settings(&mut self, channel: Channel, settings: HomeSettings) -> bool {
        if let Err(reason) = settings.validate() {
            error!(target: "svh::manager", %channel, "rejecting home settings: {reason}");
            return false;
        }
        let index = channel.index();
        self.home_settings[index] = settings;
        let runtime = &mut self.channels[index];
        if let Some(stop) = runtime.hard_stop {
            runtime.calibration = Some(ChannelCalibration::from_hard_stop(stop, &settings));
        }
        true
    }

    // Diagnostics

    pub fn get_diagnostic_status(&self, channel: Channel) -> DiagnosticState {
        self.channels[channel.index()].diagnostics
    }

    pub fn reset_diagnostic_data(&mut self, select: ChannelSelect) {
        match select {
            ChannelSelect::All => {
                for runtime in self.channels.iter_mut() {
                    runtime.diagnostics = DiagnosticState::default();
                }
            }
            ChannelSelect::One(channel) => {
                self.channels[channel.index()].diagnostics = DiagnosticState::default();
            }
        }
    }

    /// Limit motor force to `fraction` of the configured current limits
    pub fn set_max_force(&mut self, fraction: f64) -> bool {
        if !(fraction > 0.0 && fraction <= 1.0) {
            error!(target: "svh::manager", fraction, "max force must be within (0, 1]");
            return false;
        }
        self.config.max_current_percentage = fraction;
        self.force = fraction;
        if !self.is_connected() {
            return true;
        }

        let mut ok = true;
        for channel in Channel::ALL {
            if self.channels[channel.index()].switched_off {
                continue;
            }
            if let Err(e) = self
                .controller
                .set_current_settings(channel, self.board_current_settings(channel))
            {
                error!(target: "svh::manager", %channel, "could not apply max force: {e}");
                ok = false;
            }
        }
        ok
    }

    /// Scale of the slew limit during the hard-stop search, within `[0, 1]`
    pub fn set_reset_speed(&mut self, factor: f64) -> bool {
        if !(0.0..=1.0).contains(&factor) {
            error!(target: "svh::manager", factor, "reset speed must be within [0, 1]");
            return false;
        }
        self.config.reset_speed_factor = factor;
        true
    }

    /// Stall and idle-drive timeout of homing
    pub fn set_reset_timeout(&mut self, timeout: Duration) {
        self.config.homing_timeout_ms = timeout.as_millis() as u64;
    }

    // Firmware

    /// Ask the board for its firmware info again
    pub fn request_firmware_info(&self) -> bool {
        match self.controller.request_firmware_info() {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "svh::manager", "firmware info request failed: {e}");
                false
            }
        }
    }

    /// Firmware info, fetched first if none has arrived yet
    pub fn get_firmware_info(&self) -> FirmwareInfo {
        let info = self.controller.firmware_info();
        if !info.is_empty() || !self.is_connected() || !self.request_firmware_info() {
            return info;
        }
        let deadline = Instant::now() + FIRMWARE_WAIT;
        while Instant::now() < deadline {
            let info = self.controller.firmware_info();
            if !info.is_empty() {
                return info;
            }
            thread::sleep(WAIT_SLICE);
        }
        self.controller.firmware_info()
    }
}

impl Drop for HandManager {
    fn drop(&mut self) {
        self.disconnect();
    }
}
