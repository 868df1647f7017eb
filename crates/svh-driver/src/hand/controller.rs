//! Protocol-level controller
//!
//! Wraps the [`SerialInterface`] with typed commands and keeps the latest
//! state the board reported. The receiver callback is the only writer of
//! reported data; callers read snapshots.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn, Span};

use super::feedback::{
    ControlCommand, ControlCommandAll, ControllerFeedback, FeedbackAll, FirmwareInfo,
};
use super::settings::{ControllerState, CurrentSettings, EncoderSettings, PositionSettings};
use super::{Channel, CHANNEL_COUNT};
use crate::protocol::commands::{address, split_address};
use crate::protocol::{
    ByteTransport, Command, InterfaceConfig, Packet, PacketHandler, ProtocolError,
    ReceivedPacket, ReceiverStats, SerialInterface, WirePayload,
};

/// Value written to the fault and warning registers to clear them
const PWM_CLEAR: u16 = 0x001F;

#[derive(Debug, Clone)]
struct ControllerData {
    feedback: [ControllerFeedback; CHANNEL_COUNT],
    feedback_updates: [u64; CHANNEL_COUNT],
    position_settings: [PositionSettings; CHANNEL_COUNT],
    current_settings: [CurrentSettings; CHANNEL_COUNT],
    /// State last written to the board
    commanded_state: ControllerState,
    /// State last reported by the board
    reported_state: ControllerState,
    encoder: EncoderSettings,
    firmware: FirmwareInfo,
    enabled_mask: u16,
    bad_packets: u32,
    last_bad_index: Option<u8>,
}

impl Default for ControllerData {
    fn default() -> Self {
        Self {
            feedback: [ControllerFeedback::default(); CHANNEL_COUNT],
            feedback_updates: [0; CHANNEL_COUNT],
            position_settings: Channel::ALL.map(PositionSettings::default_for),
            current_settings: Channel::ALL.map(CurrentSettings::default_for),
            commanded_state: ControllerState::default(),
            reported_state: ControllerState::default(),
            encoder: EncoderSettings::default(),
            firmware: FirmwareInfo::default(),
            enabled_mask: 0,
            bad_packets: 0,
            last_bad_index: None,
        }
    }
}

type SharedData = Arc<RwLock<ControllerData>>;

fn read(data: &SharedData) -> RwLockReadGuard<'_, ControllerData> {
    data.read().unwrap_or_else(|e| e.into_inner())
}

fn write(data: &SharedData) -> RwLockWriteGuard<'_, ControllerData> {
    data.write().unwrap_or_else(|e| e.into_inner())
}

/// Typed command layer over the serial interface
pub struct Controller {
    interface: SerialInterface,
    data: SharedData,
}

impl Controller {
    /// Create a controller on `transport`; nothing is opened yet
    pub fn new(transport: Box<dyn ByteTransport>, config: InterfaceConfig, span: Span) -> Self {
        let data: SharedData = Arc::new(RwLock::new(ControllerData::default()));
        let handler: PacketHandler = {
            let data = Arc::clone(&data);
            Arc::new(move |received| dispatch(&data, received))
        };
        Self {
            interface: SerialInterface::new(transport, config, handler).with_span(span),
            data,
        }
    }

    /// Open the link and start receiving
    pub fn connect(&self, path: &str) -> Result<(), ProtocolError> {
        self.interface.connect(path)
    }

    /// Close the link. Cached state is kept.
    pub fn disconnect(&self) {
        self.interface.close();
        write(&self.data).enabled_mask = 0;
    }

    pub fn is_connected(&self) -> bool {
        self.interface.is_connected()
    }

    fn send<P: WirePayload>(&self, command: Command, channel: u8, payload: &P) -> Result<(), ProtocolError> {
        self.interface.send(payload.to_packet(address(command, channel)))
    }

    fn request(&self, command: Command, channel: u8) -> Result<(), ProtocolError> {
        self.interface.send(Packet::new(address(command, channel), Vec::new()))
    }

    // Control

    /// Command a target position [ticks]
    pub fn set_control_command(&self, channel: Channel, position: i32) -> Result<(), ProtocolError> {
        self.send(Command::SetControlCommand, channel as u8, &ControlCommand(position))
    }

    /// Command target positions of every channel in one frame [ticks]
    pub fn set_control_command_all(&self, positions: &[i32; CHANNEL_COUNT]) -> Result<(), ProtocolError> {
        self.send(Command::SetControlCommandAll, 0, &ControlCommandAll(*positions))
    }

    pub fn request_feedback(&self, channel: Channel) -> Result<(), ProtocolError> {
        self.request(Command::GetControlFeedback, channel as u8)
    }

    pub fn request_feedback_all(&self) -> Result<(), ProtocolError> {
        self.request(Command::GetControlFeedbackAll, 0)
    }

    /// Latest feedback of a channel
    pub fn feedback(&self, channel: Channel) -> ControllerFeedback {
        read(&self.data).feedback[channel.index()]
    }

    /// Number of feedback samples stored for a channel so far
    pub fn feedback_updates(&self, channel: Channel) -> u64 {
        read(&self.data).feedback_updates[channel.index()]
    }

    // Settings

    /// Send position settings
    pub fn set_position_settings(
        &self,
        channel: Channel,
        settings: PositionSettings,
    ) -> Result<(), ProtocolError> {
        self.send(Command::SetPositionSettings, channel as u8, &settings)
    }

    pub fn request_position_settings(&self, channel: Channel) -> Result<(), ProtocolError> {
        self.request(Command::GetPositionSettings, channel as u8)
    }

    /// Position settings last reported for a channel
    pub fn position_settings(&self, channel: Channel) -> PositionSettings {
        read(&self.data).position_settings[channel.index()]
    }

    /// Send current settings
    pub fn set_current_settings(
        &self,
        channel: Channel,
        settings: CurrentSettings,
    ) -> Result<(), ProtocolError> {
        self.send(Command::SetCurrentSettings, channel as u8, &settings)
    }

    pub fn request_current_settings(&self, channel: Channel) -> Result<(), ProtocolError> {
        self.request(Command::GetCurrentSettings, channel as u8)
    }

    /// Current settings last reported for a channel
    pub fn current_settings(&self, channel: Channel) -> CurrentSettings {
        read(&self.data).current_settings[channel.index()]
    }

    pub fn set_encoder_values(&self, encoder: EncoderSettings) -> Result<(), ProtocolError> {
        self.send(Command::SetEncoderValues, 0, &encoder)
    }

    pub fn request_encoder_values(&self) -> Result<(), ProtocolError> {
        self.request(Command::GetEncoderValues, 0)
    }

    pub fn encoder_values(&self) -> EncoderSettings {
        read(&self.data).encoder
    }

    pub fn request_firmware_info(&self) -> Result<(), ProtocolError> {
        self.request(Command::GetFirmwareInfo, 0)
    }

    pub fn firmware_info(&self) -> FirmwareInfo {
        read(&self.data).firmware
    }

    // Controller state

    pub fn request_controller_state(&self) -> Result<(), ProtocolError> {
        self.request(Command::GetControllerState, 0)
    }

    /// State last reported by the board
    pub fn controller_state(&self) -> ControllerState {
        read(&self.data).reported_state
    }

    fn update_state(&self, update: impl FnOnce(&mut ControllerData)) -> Result<(), ProtocolError> {
        let state = {
            let mut data = write(&self.data);
            update(&mut data);
            data.commanded_state
        };
        self.send(Command::SetControllerState, 0, &state)
    }

    /// Power up a channel's PWM stage and controllers.
    ///
    /// Faults are cleared first, then the channel's reset and active bits are
    /// set, then the position and current controllers are switched on.
    /// On a send failure the channel is left disabled in the local state.
    pub fn enable_channel(&self, channel: Channel) -> Result<(), ProtocolError> {
        let mask = channel.mask();
        if let Err(e) = self.send_enable_sequence(mask) {
            clear_channel(&mut write(&self.data), mask);
            return Err(e);
        }
        debug!(target: "svh::controller", %channel, "channel enabled");
        Ok(())
    }

    fn send_enable_sequence(&self, mask: u16) -> Result<(), ProtocolError> {
        self.update_state(|data| {
            data.commanded_state.pwm_fault = PWM_CLEAR;
            data.commanded_state.pwm_otw = PWM_CLEAR;
        })?;
        self.update_state(|data| {
            data.commanded_state.pwm_reset |= mask;
            data.commanded_state.pwm_active |= mask;
        })?;
        self.update_state(|data| {
            data.commanded_state.pos_ctrl = 1;
            data.commanded_state.cur_ctrl = 1;
            data.enabled_mask |= mask;
        })
    }

    /// Power down one channel; controllers go off with the last channel
    pub fn disable_channel(&self, channel: Channel) -> Result<(), ProtocolError> {
        let mask = channel.mask();
        self.update_state(|data| clear_channel(data, mask))?;
        debug!(target: "svh::controller", %channel, "channel disabled");
        Ok(())
    }

    /// Power down everything
    pub fn disable_all(&self) -> Result<(), ProtocolError> {
        self.update_state(|data| {
            data.commanded_state = ControllerState::default();
            data.enabled_mask = 0;
        })?;
        debug!(target: "svh::controller", "all channels disabled");
        Ok(())
    }

    pub fn is_enabled(&self, channel: Channel) -> bool {
        read(&self.data).enabled_mask & channel.mask() != 0
    }

    // Link statistics

    pub fn transmitted_count(&self) -> u32 {
        self.interface.transmitted_count()
    }

    pub fn received_count(&self) -> u32 {
        self.interface.received_count()
    }

    pub fn receiver_stats(&self) -> ReceiverStats {
        self.interface.receiver_stats()
    }

    pub fn reset_counters(&self) {
        self.interface.reset_counters();
    }

    /// Frames dropped for a bad checksum
    pub fn bad_packet_count(&self) -> u32 {
        read(&self.data).bad_packets
    }

    /// Index of the most recent frame that failed its checksum
    pub fn last_bad_index(&self) -> Option<u8> {
        read(&self.data).last_bad_index
    }
}

fn per_channel(channel: u8) -> Result<usize, ProtocolError> {
    Channel::try_from(channel).map(Channel::index)
}

fn clear_channel(data: &mut ControllerData, mask: u16) {
    data.commanded_state.pwm_reset &= !mask;
    data.commanded_state.pwm_active &= !mask;
    data.enabled_mask &= !mask;
    if data.enabled_mask == 0 {
        data.commanded_state.pos_ctrl = 0;
        data.commanded_state.cur_ctrl = 0;
    }
}

fn dispatch(data: &SharedData, received: ReceivedPacket) {
    let packet = received.packet;
    if !received.checksum_ok {
        let mut data = write(data);
        data.bad_packets += 1;
        data.last_bad_index = Some(packet.index);
        debug!(target: "svh::controller", index = packet.index, "ignoring frame with bad checksum");
        return;
    }

    let (command, channel) = split_address(packet.address);
    let Some(command) = command else {
        debug!(target: "svh::controller", address = packet.address, "unknown command");
        return;
    };

    if let Err(e) = apply(data, command, channel, &packet.payload) {
        warn!(target: "svh::controller", command = command.name(), "dropping frame: {e}");
    }
}

fn apply(data: &SharedData, command: Command, channel: u8, payload: &[u8]) -> Result<(), ProtocolError> {
    match command {
        Command::GetControlFeedback | Command::SetControlCommand => {
            let index = per_channel(channel)?;
            let feedback = ControllerFeedback::from_payload(payload)?;
            let mut data = write(data);
            data.feedback[index] = feedback;
            data.feedback_updates[index] += 1;
        }
        Command::GetControlFeedbackAll | Command::SetControlCommandAll => {
            let all = FeedbackAll::from_payload(payload)?;
            let mut data = write(data);
            data.feedback = all.0;
            for count in data.feedback_updates.iter_mut() {
                *count += 1;
            }
        }
        Command::GetPositionSettings | Command::SetPositionSettings => {
            let index = per_channel(channel)?;
            write(data).position_settings[index] = PositionSettings::from_payload(payload)?;
        }
        Command::GetCurrentSettings | Command::SetCurrentSettings => {
            let index = per_channel(channel)?;
            write(data).current_settings[index] = CurrentSettings::from_payload(payload)?;
        }
        Command::GetControllerState | Command::SetControllerState => {
            write(data).reported_state = ControllerState::from_payload(payload)?;
        }
        Command::GetEncoderValues | Command::SetEncoderValues => {
            write(data).encoder = EncoderSettings::from_payload(payload)?;
        }
        Command::GetFirmwareInfo => {
            let firmware = FirmwareInfo::from_payload(payload)?;
            info!(
                target: "svh::controller",
                major = firmware.version_major,
                minor = firmware.version_minor,
                text = %firmware.text(),
                "firmware info received"
            );
            write(data).firmware = firmware;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data() -> SharedData {
        Arc::new(RwLock::new(ControllerData::default()))
    }

    fn frame(packet: Packet, checksum_ok: bool) -> ReceivedPacket {
        ReceivedPacket {
            packet,
            received_count: 1,
            checksum_ok,
        }
    }

    #[test]
    fn test_dispatch_feedback() {
        let data = data();
        let packet = ControllerFeedback::new(1234, -56).to_packet(address(Command::SetControlCommand, 3));
        dispatch(&data, frame(packet.padded(64).unwrap(), true));

        let stored = read(&data);
        assert_eq!(stored.feedback[3], ControllerFeedback::new(1234, -56));
        assert_eq!(stored.feedback_updates[3], 1);
        assert_eq!(stored.feedback_updates[0], 0);
    }

    #[test]
    fn test_dispatch_ignores_bad_checksum() {
        let data = data();
        let mut packet = ControllerFeedback::new(1, 1).to_packet(address(Command::GetControlFeedback, 0));
        packet.index = 42;
        dispatch(&data, frame(packet, false));

        let stored = read(&data);
        assert_eq!(stored.feedback[0], ControllerFeedback::default());
        assert_eq!(stored.bad_packets, 1);
        assert_eq!(stored.last_bad_index, Some(42));
    }

    #[test]
    fn test_dispatch_rejects_short_and_out_of_range() {
        let data = data();
        dispatch(&data, frame(Packet::new(address(Command::GetControlFeedback, 2), vec![1, 2]), true));
        let feedback = ControllerFeedback::new(5, 5).to_packet(address(Command::GetControlFeedback, 12));
        dispatch(&data, frame(feedback, true));

        assert!(read(&data).feedback_updates.iter().all(|n| *n == 0));
    }

    #[test]
    fn test_dispatch_state_and_firmware() {
        let data = data();
        let state = ControllerState {
            pwm_active: 0x0004,
            ..ControllerState::default()
        };
        dispatch(&data, frame(state.to_packet(address(Command::SetControllerState, 0)), true));
        let firmware = FirmwareInfo::new(*b"SVH\0", 1, 2, "test");
        dispatch(&data, frame(firmware.to_packet(address(Command::GetFirmwareInfo, 0)), true));

        let stored = read(&data);
        assert_eq!(stored.reported_state, state);
        assert_eq!(stored.commanded_state, ControllerState::default());
        assert_eq!(stored.firmware.text(), "test");
    }
}
