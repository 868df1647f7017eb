//! Channel settings
//!
//! Position and current controller settings are tuning blobs passed through to
//! the controller board. Of those the driver itself only looks at the current
//! limiter bounds (`wmn`/`wmx`) and the position slew limit (`dwmx`).
//! Homing settings are interpreted on the host.

use serde::{Deserialize, Serialize};

use super::{Channel, CHANNEL_COUNT};
use crate::protocol::{PacketBuilder, PayloadReader, ProtocolError, WirePayload};

/// Direction a channel travels to reach its hard stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    /// `+1` or `-1`
    pub fn sign(self) -> i32 {
        match self {
            Direction::Positive => 1,
            Direction::Negative => -1,
        }
    }
}

impl TryFrom<i8> for Direction {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Direction::Positive),
            -1 => Ok(Direction::Negative),
            other => Err(format!("direction must be +1 or -1, got {other}")),
        }
    }
}

impl From<Direction> for i8 {
    fn from(direction: Direction) -> Self {
        direction.sign() as i8
    }
}

/// Homing parameters of one channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HomeSettings {
    /// Direction of travel towards the hard stop
    pub direction: Direction,
    /// Soft limit offset from the hard stop [ticks]
    pub minimum_offset: i32,
    /// Soft limit offset from the hard stop [ticks]
    pub maximum_offset: i32,
    /// Park position, applied as `direction * idle_position` from the hard stop [ticks]
    pub idle_position: i32,
    /// Angular span mapped onto the soft limit range [rad]
    pub range_rad: f64,
    /// Fraction of the current limit treated as "hard stop reached", in `[0, 1]`
    pub reset_current_factor: f64,
}

impl HomeSettings {
    pub fn new(
        direction: Direction,
        minimum_offset: i32,
        maximum_offset: i32,
        idle_position: i32,
        range_rad: f64,
        reset_current_factor: f64,
    ) -> Self {
        Self {
            direction,
            minimum_offset,
            maximum_offset,
            idle_position,
            range_rad,
            reset_current_factor,
        }
    }

    /// Factory defaults for a channel
    pub fn default_for(channel: Channel) -> Self {
        use Direction::*;
        match channel {
            Channel::ThumbFlexion => Self::new(Positive, -175_000, -5_000, -15_000, 0.97709, 0.75),
            Channel::ThumbOpposition => {
                Self::new(Positive, -105_000, -5_000, -15_000, 0.99483, 0.75)
            }
            Channel::IndexFingerDistal | Channel::MiddleFingerDistal => {
                Self::new(Positive, -47_000, -2_000, -8_000, 1.33, 0.75)
            }
            Channel::IndexFingerProximal | Channel::MiddleFingerProximal => {
                Self::new(Negative, 2_000, 42_000, -8_000, 0.8, 0.75)
            }
            Channel::RingFinger | Channel::Pinky => {
                Self::new(Positive, -47_000, -2_000, -8_000, 0.98786, 0.75)
            }
            Channel::FingerSpread => Self::new(Positive, -47_000, -2_000, -25_000, 0.5829, 0.4),
        }
    }

    /// Radians per tick, oriented so positions grow away from the hard stop
    pub fn ticks_to_rad(&self) -> f64 {
        let span = self.maximum_offset as f64 - self.minimum_offset as f64;
        self.range_rad / span * -(self.direction.sign() as f64)
    }

    /// Park position relative to the hard stop [ticks]
    pub fn home_offset(&self) -> i64 {
        self.direction.sign() as i64 * self.idle_position as i64
    }

    /// Check the settings can produce a usable calibration
    pub fn validate(&self) -> Result<(), String> {
        if self.minimum_offset == self.maximum_offset {
            return Err("minimum and maximum offset must differ".into());
        }
        if !(self.range_rad.is_finite() && self.range_rad > 0.0) {
            return Err(format!("range must be positive, got {}", self.range_rad));
        }
        if !(0.0..=1.0).contains(&self.reset_current_factor) {
            return Err(format!(
                "reset current factor must be within [0, 1], got {}",
                self.reset_current_factor
            ));
        }
        let low = self.minimum_offset.min(self.maximum_offset) as i64;
        let high = self.minimum_offset.max(self.maximum_offset) as i64;
        if !(low..=high).contains(&self.home_offset()) {
            return Err(format!(
                "idle position {} lies outside the soft limits [{low}, {high}]",
                self.home_offset()
            ));
        }
        Ok(())
    }
}

/// Position controller settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionSettings {
    /// Reference signal minimum
    pub wmn: f32,
    /// Reference signal maximum
    pub wmx: f32,
    /// Reference signal slew limit [ticks/s]
    pub dwmx: f32,
    /// Measurement scaling
    pub ky: f32,
    /// Time base [s]
    pub dt: f32,
    /// Integral minimum
    pub imn: f32,
    /// Integral maximum
    pub imx: f32,
    /// Proportional gain
    pub kp: f32,
    /// Integral gain
    pub ki: f32,
    /// Derivative gain
    pub kd: f32,
}

impl PositionSettings {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wmn: f32,
        wmx: f32,
        dwmx: f32,
        ky: f32,
        dt: f32,
        imn: f32,
        imx: f32,
        kp: f32,
        ki: f32,
        kd: f32,
    ) -> Self {
        Self {
            wmn,
            wmx,
            dwmx,
            ky,
            dt,
            imn,
            imx,
            kp,
            ki,
            kd,
        }
    }

    /// Factory defaults for a channel
    pub fn default_for(channel: Channel) -> Self {
        let (dwmx, ki, kp, kd) = match channel {
            Channel::ThumbFlexion => (65.0e3, 0.0, 0.5, 400.0),
            Channel::ThumbOpposition => (50.0e3, 0.1, 0.5, 100.0),
            Channel::IndexFingerDistal | Channel::MiddleFingerDistal => (8.0e3, 0.0, 0.5, 1500.0),
            Channel::IndexFingerProximal | Channel::MiddleFingerProximal => {
                (35.0e3, 0.0, 0.8, 800.0)
            }
            Channel::RingFinger | Channel::Pinky => (35.0e3, 0.0, 0.5, 800.0),
            Channel::FingerSpread => (25.0e3, 0.0, 0.5, 100.0),
        };
        Self::new(-1.0e6, 1.0e6, dwmx, 1.0, 1e-3, -500.0, 500.0, kp, ki, kd)
    }

    /// Same settings with the slew limit scaled by `factor`
    pub fn with_speed_factor(mut self, factor: f64) -> Self {
        self.dwmx = (self.dwmx as f64 * factor) as f32;
        self
    }
}

impl WirePayload for PositionSettings {
    const NAME: &'static str = "position_settings";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder
            .f32(self.wmn)
            .f32(self.wmx)
            .f32(self.dwmx)
            .f32(self.ky)
            .f32(self.dt)
            .f32(self.imn)
            .f32(self.imx)
            .f32(self.kp)
            .f32(self.ki)
            .f32(self.kd)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            wmn: reader.f32()?,
            wmx: reader.f32()?,
            dwmx: reader.f32()?,
            ky: reader.f32()?,
            dt: reader.f32()?,
            imn: reader.f32()?,
            imx: reader.f32()?,
            kp: reader.f32()?,
            ki: reader.f32()?,
            kd: reader.f32()?,
        })
    }
}

/// Current controller settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentSettings {
    /// Current limiter minimum [mA]
    pub wmn: f32,
    /// Current limiter maximum [mA]
    pub wmx: f32,
    /// Measurement scaling
    pub ky: f32,
    /// Time base [s]
    pub dt: f32,
    /// Integral minimum
    pub imn: f32,
    /// Integral maximum
    pub imx: f32,
    /// Proportional gain
    pub kp: f32,
    /// Integral gain
    pub ki: f32,
    /// Output voltage minimum
    pub umn: f32,
    /// Output voltage maximum
    pub umx: f32,
}

impl CurrentSettings {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wmn: f32,
        wmx: f32,
        ky: f32,
        dt: f32,
        imn: f32,
        imx: f32,
        kp: f32,
        ki: f32,
        umn: f32,
        umx: f32,
    ) -> Self {
        Self {
            wmn,
            wmx,
            ky,
            dt,
            imn,
            imx,
            kp,
            ki,
            umn,
            umx,
        }
    }

    /// Factory defaults for a channel
    pub fn default_for(channel: Channel) -> Self {
        let (limit, kp, ki) = match channel {
            Channel::ThumbFlexion | Channel::ThumbOpposition => (500.0, 0.6, 10.0),
            Channel::IndexFingerDistal | Channel::MiddleFingerDistal => (300.0, 0.3, 10.0),
            Channel::IndexFingerProximal | Channel::MiddleFingerProximal => (350.0, 0.5, 10.0),
            Channel::RingFinger | Channel::Pinky => (300.0, 0.05, 10.0),
            Channel::FingerSpread => (500.0, 0.7, 60.0),
        };
        Self::new(-limit, limit, 0.405, 4e-6, -limit, limit, kp, ki, -255.0, 255.0)
    }

    /// Largest current magnitude the limiter allows [mA]
    pub fn limit_magnitude(&self) -> f64 {
        (self.wmn as f64).abs().max((self.wmx as f64).abs())
    }

    /// Same settings with the limiter bounds scaled by `factor`
    pub fn scaled(mut self, factor: f64) -> Self {
        self.wmn = (self.wmn as f64 * factor) as f32;
        self.wmx = (self.wmx as f64 * factor) as f32;
        self
    }
}

impl WirePayload for CurrentSettings {
    const NAME: &'static str = "current_settings";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder
            .f32(self.wmn)
            .f32(self.wmx)
            .f32(self.ky)
            .f32(self.dt)
            .f32(self.imn)
            .f32(self.imx)
            .f32(self.kp)
            .f32(self.ki)
            .f32(self.umn)
            .f32(self.umx)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            wmn: reader.f32()?,
            wmx: reader.f32()?,
            ky: reader.f32()?,
            dt: reader.f32()?,
            imn: reader.f32()?,
            imx: reader.f32()?,
            kp: reader.f32()?,
            ki: reader.f32()?,
            umn: reader.f32()?,
            umx: reader.f32()?,
        })
    }
}

/// PWM stage and controller enable state of the board
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerState {
    /// PWM fault flags (one bit per channel group), write 0x001F to clear
    pub pwm_fault: u16,
    /// Over-temperature warning flags, write 0x001F to clear
    pub pwm_otw: u16,
    /// Per-channel PWM reset release bits
    pub pwm_reset: u16,
    /// Per-channel PWM active bits
    pub pwm_active: u16,
    /// Position controller enable
    pub pos_ctrl: u16,
    /// Current controller enable
    pub cur_ctrl: u16,
}

impl WirePayload for ControllerState {
    const NAME: &'static str = "controller_state";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder
            .u16(self.pwm_fault)
            .u16(self.pwm_otw)
            .u16(self.pwm_reset)
            .u16(self.pwm_active)
            .u16(self.pos_ctrl)
            .u16(self.cur_ctrl)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            pwm_fault: reader.u16()?,
            pwm_otw: reader.u16()?,
            pwm_reset: reader.u16()?,
            pwm_active: reader.u16()?,
            pos_ctrl: reader.u16()?,
            cur_ctrl: reader.u16()?,
        })
    }
}

/// Encoder scaling factors, one per channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderSettings {
    pub scalings: [u32; CHANNEL_COUNT],
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            scalings: [1; CHANNEL_COUNT],
        }
    }
}

impl WirePayload for EncoderSettings {
    const NAME: &'static str = "encoder_settings";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        self.scalings
            .iter()
            .fold(builder, |builder, scaling| builder.u32(*scaling))
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let mut scalings = [0u32; CHANNEL_COUNT];
        for scaling in scalings.iter_mut() {
            *scaling = reader.u32()?;
        }
        Ok(Self { scalings })
    }
}
