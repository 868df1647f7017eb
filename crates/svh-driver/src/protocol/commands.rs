//! Protocol commands
//!
//! Defines the commands understood by the SVH controller board. The command
//! id lives in the low nibble of a frame's address byte; per-channel commands
//! carry the channel index in the high nibble.

use serde::{Deserialize, Serialize};

/// Protocol commands for hand communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Command {
    /// Read position and current of one channel
    GetControlFeedback,

    /// Set the target position of one channel (answered with feedback)
    SetControlCommand,

    /// Read position and current of all channels
    GetControlFeedbackAll,

    /// Set the target positions of all channels (answered with feedback)
    SetControlCommandAll,

    /// Read position controller settings of one channel
    GetPositionSettings,

    /// Write position controller settings of one channel
    SetPositionSettings,

    /// Read current controller settings of one channel
    GetCurrentSettings,

    /// Write current controller settings of one channel
    SetCurrentSettings,

    /// Read PWM and controller enable state
    GetControllerState,

    /// Write PWM and controller enable state
    SetControllerState,

    /// Read encoder scalings
    GetEncoderValues,

    /// Write encoder scalings
    SetEncoderValues,

    /// Read firmware identification
    GetFirmwareInfo,
}

impl Command {
    /// All commands, in id order
    pub const ALL: [Command; 13] = [
        Command::GetControlFeedback,
        Command::SetControlCommand,
        Command::GetControlFeedbackAll,
        Command::SetControlCommandAll,
        Command::GetPositionSettings,
        Command::SetPositionSettings,
        Command::GetCurrentSettings,
        Command::SetCurrentSettings,
        Command::GetControllerState,
        Command::SetControllerState,
        Command::GetEncoderValues,
        Command::SetEncoderValues,
        Command::GetFirmwareInfo,
    ];

    /// Get the command id (address low nibble)
    pub fn id(&self) -> u8 {
        match self {
            Command::GetControlFeedback => 0x00,
            Command::SetControlCommand => 0x01,
            Command::GetControlFeedbackAll => 0x02,
            Command::SetControlCommandAll => 0x03,
            Command::GetPositionSettings => 0x04,
            Command::SetPositionSettings => 0x05,
            Command::GetCurrentSettings => 0x06,
            Command::SetCurrentSettings => 0x07,
            Command::GetControllerState => 0x08,
            Command::SetControllerState => 0x09,
            Command::GetEncoderValues => 0x0A,
            Command::SetEncoderValues => 0x0B,
            Command::GetFirmwareInfo => 0x0C,
        }
    }

    /// Look up a command by id
    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    /// Check if this command addresses a single channel
    pub fn is_per_channel(&self) -> bool {
        matches!(
            self,
            Command::GetControlFeedback
                | Command::SetControlCommand
                | Command::GetPositionSettings
                | Command::SetPositionSettings
                | Command::GetCurrentSettings
                | Command::SetCurrentSettings
        )
    }

    /// Short name used in log and error messages
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetControlFeedback => "get_control_feedback",
            Command::SetControlCommand => "set_control_command",
            Command::GetControlFeedbackAll => "get_control_feedback_all",
            Command::SetControlCommandAll => "set_control_command_all",
            Command::GetPositionSettings => "get_position_settings",
            Command::SetPositionSettings => "set_position_settings",
            Command::GetCurrentSettings => "get_current_settings",
            Command::SetCurrentSettings => "set_current_settings",
            Command::GetControllerState => "get_controller_state",
            Command::SetControllerState => "set_controller_state",
            Command::GetEncoderValues => "get_encoder_values",
            Command::SetEncoderValues => "set_encoder_values",
            Command::GetFirmwareInfo => "get_firmware_info",
        }
    }
}

/// Build the address byte for a command, optionally targeting a channel
pub fn address(command: Command, channel: u8) -> u8 {
    ((channel & 0x0F) << 4) | command.id()
}

/// Split an address byte into its command and channel nibble
pub fn split_address(address: u8) -> (Option<Command>, u8) {
    (Command::from_id(address & 0x0F), address >> 4)
}
