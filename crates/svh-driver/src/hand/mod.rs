//! Hand control
//!
//! Channel definitions, settings payloads, the protocol-level [`Controller`]
//! and the [`HandManager`] that turns it into a homed, bounds-checked
//! position interface.

pub mod calibration;
mod channel;
mod controller;
mod feedback;
pub mod homing;
mod manager;
mod poller;
mod settings;

pub use calibration::{current_settings_are_safe, ChannelCalibration};
pub use channel::{Channel, ChannelSelect, CHANNEL_COUNT, RESET_ORDER};
pub use controller::Controller;
pub use feedback::{
    ControlCommand, ControlCommandAll, ControllerFeedback, FeedbackAll, FirmwareInfo,
    FIRMWARE_TEXT_LEN,
};
pub use homing::{DiagnosticState, HomingFailure, HomingPhase, HomingRun};
pub use manager::{HandManager, MAX_RESET_RETRIES};
pub use poller::FeedbackPoller;
pub use settings::{
    ControllerState, CurrentSettings, Direction, EncoderSettings, HomeSettings, PositionSettings,
};
