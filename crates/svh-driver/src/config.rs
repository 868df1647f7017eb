//! Driver configuration
//!
//! Stored as JSON. Every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::hand::{Channel, CurrentSettings, HomeSettings, PositionSettings, CHANNEL_COUNT};
use crate::protocol::{InterfaceConfig, DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS};

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid channel index: {0}")]
    InvalidChannel(u8),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// A channel given by name or by index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelRef {
    Name(Channel),
    Index(u8),
}

impl ChannelRef {
    pub fn resolve(self) -> Result<Channel, ConfigError> {
        match self {
            ChannelRef::Name(channel) => Ok(channel),
            ChannelRef::Index(index) => {
                Channel::try_from(index).map_err(|_| ConfigError::InvalidChannel(index))
            }
        }
    }
}

impl From<Channel> for ChannelRef {
    fn from(channel: Channel) -> Self {
        ChannelRef::Name(channel)
    }
}

/// Hand driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandConfig {
    /// Serial baud rate
    pub baud_rate: u32,

    /// Receiver read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Pause after every sent frame in microseconds
    pub inter_frame_delay_us: u64,

    /// Connect handshake timeout per attempt in milliseconds
    pub connect_timeout_ms: u64,

    /// Connect attempts after the first one
    pub connect_retries: u32,

    /// Homing stall and idle-drive timeout in milliseconds
    pub homing_timeout_ms: u64,

    /// Period of the homing command loop in milliseconds
    pub homing_cycle_ms: u64,

    /// Scale applied to the position slew limit while searching the hard stop
    pub reset_speed_factor: f64,

    /// Feedback poller period in milliseconds
    pub poll_interval_ms: u64,

    /// Fraction of the observed current used as safety ceiling and force limit
    pub max_current_percentage: f64,

    /// Channels simulated as healthy without being driven
    pub disabled_channels: Vec<ChannelRef>,

    /// Per-channel homing overrides
    pub home_settings: BTreeMap<Channel, HomeSettings>,

    /// Per-channel position controller overrides
    pub position_settings: BTreeMap<Channel, PositionSettings>,

    /// Per-channel current controller overrides
    pub current_settings: BTreeMap<Channel, CurrentSettings>,
}

impl Default for HandConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            inter_frame_delay_us: 782,
            connect_timeout_ms: 1000,
            connect_retries: 3,
            homing_timeout_ms: 10_000,
            homing_cycle_ms: 10,
            reset_speed_factor: 0.2,
            poll_interval_ms: 100,
            max_current_percentage: 0.9,
            disabled_channels: Vec::new(),
            home_settings: BTreeMap::new(),
            position_settings: BTreeMap::new(),
            current_settings: BTreeMap::new(),
        }
    }
}

impl HandConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: HandConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Check value ranges and channel references
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.reset_speed_factor) {
            return Err(ConfigError::InvalidValue {
                field: "reset_speed_factor",
                reason: format!("{} is outside [0, 1]", self.reset_speed_factor),
            });
        }
        if !(self.max_current_percentage > 0.0 && self.max_current_percentage <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "max_current_percentage",
                reason: format!("{} is outside (0, 1]", self.max_current_percentage),
            });
        }
        if self.baud_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "baud_rate",
                reason: "must be positive".into(),
            });
        }
        for (field, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("homing_cycle_ms", self.homing_cycle_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be positive".into(),
                });
            }
        }
        for (channel, home) in &self.home_settings {
            home.validate().map_err(|reason| ConfigError::InvalidValue {
                field: "home_settings",
                reason: format!("{channel}: {reason}"),
            })?;
        }
        self.switched_off()?;
        Ok(())
    }

    /// Switched-off flag per channel index
    pub fn switched_off(&self) -> Result<[bool; CHANNEL_COUNT], ConfigError> {
        let mut mask = [false; CHANNEL_COUNT];
        for channel in &self.disabled_channels {
            mask[channel.resolve()?.index()] = true;
        }
        Ok(mask)
    }

    /// Link settings for the serial interface
    pub fn interface(&self) -> InterfaceConfig {
        InterfaceConfig {
            baud_rate: self.baud_rate,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            inter_frame_delay: Duration::from_micros(self.inter_frame_delay_us),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }

    pub fn homing_cycle(&self) -> Duration {
        Duration::from_millis(self.homing_cycle_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
