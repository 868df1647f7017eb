//! Feedback and identification payloads

use serde::{Deserialize, Serialize};

use super::CHANNEL_COUNT;
use crate::protocol::{PacketBuilder, PayloadReader, ProtocolError, WirePayload};

/// Latest position/current snapshot of one channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerFeedback {
    /// Encoder position [ticks]
    pub position: i32,
    /// Motor current [mA]
    pub current: i16,
}

impl ControllerFeedback {
    pub fn new(position: i32, current: i16) -> Self {
        Self { position, current }
    }
}

impl WirePayload for ControllerFeedback {
    const NAME: &'static str = "control_feedback";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder.i32(self.position).i16(self.current)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            position: reader.i32()?,
            current: reader.i16()?,
        })
    }
}

/// Feedback of every channel, as sent in one frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedbackAll(pub [ControllerFeedback; CHANNEL_COUNT]);

impl WirePayload for FeedbackAll {
    const NAME: &'static str = "control_feedback_all";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        self.0
            .iter()
            .fold(builder, |builder, feedback| feedback.write(builder))
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let mut all = [ControllerFeedback::default(); CHANNEL_COUNT];
        for feedback in all.iter_mut() {
            *feedback = ControllerFeedback::read(reader)?;
        }
        Ok(Self(all))
    }
}

/// Target position of one channel [ticks]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCommand(pub i32);

impl WirePayload for ControlCommand {
    const NAME: &'static str = "control_command";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder.i32(self.0)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self(reader.i32()?))
    }
}

/// Target positions of every channel [ticks]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCommandAll(pub [i32; CHANNEL_COUNT]);

impl WirePayload for ControlCommandAll {
    const NAME: &'static str = "control_command_all";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        self.0.iter().fold(builder, |builder, target| builder.i32(*target))
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        let mut targets = [0i32; CHANNEL_COUNT];
        for target in targets.iter_mut() {
            *target = reader.i32()?;
        }
        Ok(Self(targets))
    }
}

/// Length of the free-text field of [`FirmwareInfo`]
pub const FIRMWARE_TEXT_LEN: usize = 48;

/// Firmware identification reported by the controller board
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub id: [u8; 4],
    pub version_major: u16,
    pub version_minor: u16,
    pub text: [u8; FIRMWARE_TEXT_LEN],
}

impl Default for FirmwareInfo {
    fn default() -> Self {
        Self {
            id: [0; 4],
            version_major: 0,
            version_minor: 0,
            text: [0; FIRMWARE_TEXT_LEN],
        }
    }
}

impl FirmwareInfo {
    /// Build an info block from string parts; text longer than the field is cut
    pub fn new(id: [u8; 4], version_major: u16, version_minor: u16, text: &str) -> Self {
        let mut buf = [0u8; FIRMWARE_TEXT_LEN];
        let bytes = text.as_bytes();
        let n = bytes.len().min(FIRMWARE_TEXT_LEN);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self {
            id,
            version_major,
            version_minor,
            text: buf,
        }
    }

    /// Whether nothing has been received yet
    pub fn is_empty(&self) -> bool {
        self.version_major == 0 && self.version_minor == 0
    }

    /// Free text up to the first NUL
    pub fn text(&self) -> String {
        let end = self.text.iter().position(|b| *b == 0).unwrap_or(FIRMWARE_TEXT_LEN);
        String::from_utf8_lossy(&self.text[..end]).into_owned()
    }
}

impl WirePayload for FirmwareInfo {
    const NAME: &'static str = "firmware_info";

    fn write(&self, builder: PacketBuilder) -> PacketBuilder {
        builder
            .bytes(&self.id)
            .u16(self.version_major)
            .u16(self.version_minor)
            .bytes(&self.text)
    }

    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: reader.array()?,
            version_major: reader.u16()?,
            version_minor: reader.u16()?,
            text: reader.array()?,
        })
    }
}
