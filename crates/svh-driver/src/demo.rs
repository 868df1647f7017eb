//! Demo Mode - in-process stand-ins for the hand hardware
//!
//! [`LoopbackTransport`] echoes every written byte back to the reader.
//! [`SimulatedHand`] emulates the controller board: it parses incoming frames,
//! answers every frame with one frame of the same address and index, and
//! moves nine simulated channels between two mechanical stops. Current
//! readings carry a little seeded noise.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::hand::{
    Channel, ControlCommand, ControlCommandAll, ControllerFeedback, ControllerState,
    CurrentSettings, EncoderSettings, FeedbackAll, FirmwareInfo, PositionSettings, CHANNEL_COUNT,
};
use crate::protocol::commands::split_address;
use crate::protocol::{ByteTransport, Command, FrameReceiver, Packet, WirePayload};

/// Mechanical stops of every simulated channel [ticks]
pub const SIMULATED_STOPS: (i32, i32) = (-30_000, 30_000);

/// Default noise seed
const DEFAULT_SEED: u64 = 0x5356_4821;

/// Current drawn while moving freely [mA]
const MOVING_CURRENT: i16 = 40;

/// Current noise amplitude [mA]
const CURRENT_NOISE: i16 = 3;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn not_open() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport not open")
}

/// Take up to `buf.len()` bytes from `queue`, waiting at most `timeout` for
/// the first one
fn drain<T>(
    mutex: &Mutex<T>,
    ready: &Condvar,
    buf: &mut [u8],
    timeout: Duration,
    queue: impl Fn(&mut T) -> &mut VecDeque<u8>,
) -> usize {
    let deadline = Instant::now() + timeout;
    let mut guard = lock(mutex);
    while queue(&mut *guard).is_empty() {
        let now = Instant::now();
        if now >= deadline {
            return 0;
        }
        guard = match ready.wait_timeout(guard, deadline - now) {
            Ok((guard, _)) => guard,
            Err(e) => e.into_inner().0,
        };
    }
    let pending = queue(&mut *guard);
    let n = buf.len().min(pending.len());
    for (slot, byte) in buf.iter_mut().zip(pending.drain(..n)) {
        *slot = byte;
    }
    n
}

#[derive(Debug, Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    ready: Condvar,
}

/// Transport that reads back whatever was written to it
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pipe: Arc<Pipe>,
    open: bool,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteTransport for LoopbackTransport {
    fn open(&mut self, _path: &str, _baud_rate: u32) -> io::Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.open {
            return Err(not_open());
        }
        Ok(drain(&self.pipe.bytes, &self.pipe.ready, buf, timeout, |q| q))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(not_open());
        }
        lock(&self.pipe.bytes).extend(buf);
        self.pipe.ready.notify_all();
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>> {
        if !self.open {
            return Err(not_open());
        }
        Ok(Box::new(Self {
            pipe: Arc::clone(&self.pipe),
            open: true,
        }))
    }
}

#[derive(Debug, Clone)]
struct SimulatedChannel {
    position: i32,
    target: i32,
    current: i16,
    position_settings: PositionSettings,
    current_settings: CurrentSettings,
    jammed: bool,
}

impl SimulatedChannel {
    fn new(channel: Channel) -> Self {
        Self {
            position: 0,
            target: 0,
            current: 0,
            position_settings: PositionSettings::default_for(channel),
            current_settings: CurrentSettings::default_for(channel),
            jammed: false,
        }
    }

    fn feedback(&self) -> ControllerFeedback {
        ControllerFeedback::new(self.position, self.current)
    }

    fn advance(&mut self, enabled: bool, rng: &mut StdRng) {
        let noise = rng.gen_range(-CURRENT_NOISE..=CURRENT_NOISE);
        if !enabled || self.jammed {
            self.current = noise;
            return;
        }

        let (low, high) = SIMULATED_STOPS;
        let step = ((self.position_settings.dwmx / 10.0) as i64).max(1);
        let delta = (self.target as i64 - self.position as i64).clamp(-step, step);
        let wanted = self.position as i64 + delta;
        self.position = wanted.clamp(low as i64, high as i64) as i32;

        self.current = if self.target > high && self.position == high {
            self.current_settings.wmx as i16 + noise
        } else if self.target < low && self.position == low {
            self.current_settings.wmn as i16 + noise
        } else if delta != 0 {
            delta.signum() as i16 * MOVING_CURRENT + noise
        } else {
            noise
        };
    }
}

#[derive(Debug)]
struct HandModel {
    receiver: FrameReceiver,
    outgoing: VecDeque<u8>,
    channels: Vec<SimulatedChannel>,
    controller_state: ControllerState,
    encoder: EncoderSettings,
    firmware: FirmwareInfo,
    rng: StdRng,
    silent: bool,
    drop_every: Option<u32>,
    corrupt_every: Option<u32>,
    responses: u32,
    command_counts: HashMap<Command, u32>,
}

impl HandModel {
    fn new(seed: u64) -> Self {
        Self {
            receiver: FrameReceiver::new(),
            outgoing: VecDeque::new(),
            channels: Channel::ALL.iter().map(|c| SimulatedChannel::new(*c)).collect(),
            controller_state: ControllerState::default(),
            encoder: EncoderSettings::default(),
            firmware: FirmwareInfo::new(*b"SVH\0", 0, 13, "SVH simulated controller"),
            rng: StdRng::seed_from_u64(seed),
            silent: false,
            drop_every: None,
            corrupt_every: None,
            responses: 0,
            command_counts: HashMap::new(),
        }
    }

    fn channel_enabled(&self, index: usize) -> bool {
        let mask = 1u16 << index;
        self.controller_state.pos_ctrl != 0 && self.controller_state.pwm_active & mask != 0
    }

    fn advance(&mut self) {
        for index in 0..CHANNEL_COUNT {
            let enabled = self.channel_enabled(index);
            self.channels[index].advance(enabled, &mut self.rng);
        }
    }

    fn feedback_all(&self) -> FeedbackAll {
        let mut all = [ControllerFeedback::default(); CHANNEL_COUNT];
        for (slot, channel) in all.iter_mut().zip(&self.channels) {
            *slot = channel.feedback();
        }
        FeedbackAll(all)
    }

    /// Apply one frame and build the answer payload
    fn handle(&mut self, packet: &Packet) -> Option<Vec<u8>> {
        let (command, channel) = split_address(packet.address);
        let command = command?;
        *self.command_counts.entry(command).or_insert(0) += 1;

        let index = channel as usize;
        if command.is_per_channel() && index >= CHANNEL_COUNT {
            return None;
        }
        let payload = packet.payload.as_slice();

        let response = match command {
            Command::GetControlFeedback => {
                self.advance();
                let feedback = self.channels[index].feedback();
                feedback.to_packet(packet.address).payload
            }
            Command::SetControlCommand => {
                self.channels[index].target = ControlCommand::from_payload(payload).ok()?.0;
                self.advance();
                let feedback = self.channels[index].feedback();
                feedback.to_packet(packet.address).payload
            }
            Command::GetControlFeedbackAll => {
                self.advance();
                let all = self.feedback_all();
                all.to_packet(packet.address).payload
            }
            Command::SetControlCommandAll => {
                let targets = ControlCommandAll::from_payload(payload).ok()?.0;
                for (channel, target) in self.channels.iter_mut().zip(targets) {
                    channel.target = target;
                }
                self.advance();
                let all = self.feedback_all();
                all.to_packet(packet.address).payload
            }
            Command::GetPositionSettings | Command::SetPositionSettings => {
                if command == Command::SetPositionSettings {
                    self.channels[index].position_settings =
                        PositionSettings::from_payload(payload).ok()?;
                }
                let settings = self.channels[index].position_settings;
                settings.to_packet(packet.address).payload
            }
            Command::GetCurrentSettings | Command::SetCurrentSettings => {
                if command == Command::SetCurrentSettings {
                    self.channels[index].current_settings =
                        CurrentSettings::from_payload(payload).ok()?;
                }
                let settings = self.channels[index].current_settings;
                settings.to_packet(packet.address).payload
            }
            Command::GetControllerState | Command::SetControllerState => {
                if command == Command::SetControllerState {
                    self.controller_state = ControllerState::from_payload(payload).ok()?;
                }
                let state = self.controller_state;
                state.to_packet(packet.address).payload
            }
            Command::GetEncoderValues | Command::SetEncoderValues => {
                if command == Command::SetEncoderValues {
                    self.encoder = EncoderSettings::from_payload(payload).ok()?;
                }
                let encoder = self.encoder;
                encoder.to_packet(packet.address).payload
            }
            Command::GetFirmwareInfo => {
                let firmware = self.firmware;
                firmware.to_packet(packet.address).payload
            }
        };
        Some(response)
    }

    fn respond(&mut self, request: &Packet) {
        let Some(payload) = self.handle(request) else {
            return;
        };
        if self.silent {
            return;
        }
        self.responses += 1;
        if self.drop_every.is_some_and(|n| self.responses % n == 0) {
            return;
        }

        let mut bytes = Packet {
            index: request.index,
            address: request.address,
            payload,
        }
        .to_bytes();
        if self.corrupt_every.is_some_and(|n| self.responses % n == 0) && bytes.len() > 8 {
            bytes[6] ^= 0x5A;
        }
        self.outgoing.extend(bytes);
    }
}

#[derive(Debug)]
struct SharedModel {
    model: Mutex<HandModel>,
    ready: Condvar,
}

/// Simulated SVH hand usable wherever a [`ByteTransport`] is expected.
///
/// Clones share the same simulated hardware, so a test can keep one handle
/// for inspection and hand another to the driver.
#[derive(Debug, Clone)]
pub struct SimulatedHand {
    shared: Arc<SharedModel>,
    open: bool,
}

impl Default for SimulatedHand {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedHand {
    /// Create a simulated hand with the default noise seed
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Create a simulated hand with a specific noise seed
    pub fn with_seed(seed: u64) -> Self {
        Self {
            shared: Arc::new(SharedModel {
                model: Mutex::new(HandModel::new(seed)),
                ready: Condvar::new(),
            }),
            open: false,
        }
    }

    fn model(&self) -> MutexGuard<'_, HandModel> {
        lock(&self.shared.model)
    }

    /// Freeze a channel's encoder, as if it were blocked mechanically
    pub fn jam(&self, channel: Channel) {
        self.model().channels[channel.index()].jammed = true;
    }

    /// Stop answering frames
    pub fn set_silent(&self, silent: bool) {
        self.model().silent = silent;
    }

    /// Drop every `n`-th answer; `None` answers everything
    pub fn drop_every(&self, n: Option<u32>) {
        self.model().drop_every = n.filter(|n| *n > 0);
    }

    /// Damage the payload of every `n`-th answer
    pub fn corrupt_every(&self, n: Option<u32>) {
        self.model().corrupt_every = n.filter(|n| *n > 0);
    }

    /// Number of frames received with `command`
    pub fn command_count(&self, command: Command) -> u32 {
        self.model().command_counts.get(&command).copied().unwrap_or(0)
    }

    /// Simulated encoder position [ticks]
    pub fn position(&self, channel: Channel) -> i32 {
        self.model().channels[channel.index()].position
    }

    /// Last commanded target [ticks]
    pub fn target(&self, channel: Channel) -> i32 {
        self.model().channels[channel.index()].target
    }

    /// Current settings the simulated board holds
    pub fn current_settings(&self, channel: Channel) -> CurrentSettings {
        self.model().channels[channel.index()].current_settings
    }

    /// Controller state the simulated board holds
    pub fn controller_state(&self) -> ControllerState {
        self.model().controller_state
    }
}

impl ByteTransport for SimulatedHand {
    fn open(&mut self, _path: &str, _baud_rate: u32) -> io::Result<()> {
        self.open = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if !self.open {
            return Err(not_open());
        }
        Ok(drain(
            &self.shared.model,
            &self.shared.ready,
            buf,
            timeout,
            |m| &mut m.outgoing,
        ))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Err(not_open());
        }
        let mut model = self.model();
        let mut receiver = std::mem::take(&mut model.receiver);
        let mut frames = Vec::new();
        receiver.feed_all(buf, |received| {
            if received.checksum_ok {
                frames.push(received.packet);
            }
        });
        model.receiver = receiver;
        for frame in &frames {
            model.respond(frame);
        }
        drop(model);
        self.shared.ready.notify_all();
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>> {
        if !self.open {
            return Err(not_open());
        }
        Ok(Box::new(Self {
            shared: Arc::clone(&self.shared),
            open: true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::commands::address;
    use crate::protocol::FRAME_PAYLOAD_SIZE;

    fn exchange(hand: &mut SimulatedHand, packet: Packet) -> Packet {
        hand.write(&packet.padded(FRAME_PAYLOAD_SIZE).unwrap().to_bytes())
            .unwrap();
        let mut buf = [0u8; 256];
        let n = hand.read(&mut buf, Duration::from_millis(100)).unwrap();
        Packet::from_bytes(&buf[..n]).unwrap()
    }

    #[test]
    fn test_loopback() {
        let mut transport = LoopbackTransport::new();
        assert!(transport.write(&[1]).is_err());
        transport.open("loop", 0).unwrap();
        let mut reader = transport.try_clone().unwrap();

        transport.write(&[1, 2, 3]).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(reader.read(&mut buf, Duration::from_millis(10)).unwrap(), 2);
        assert_eq!(reader.read(&mut buf, Duration::from_millis(10)).unwrap(), 1);
        assert_eq!(buf[0], 3);
        assert_eq!(reader.read(&mut buf, Duration::from_millis(5)).unwrap(), 0);
    }

    #[test]
    fn test_answers_with_same_address_and_index() {
        let mut hand = SimulatedHand::new();
        hand.open("sim", 921_600).unwrap();

        let mut request = Packet::new(address(Command::GetFirmwareInfo, 0), vec![]);
        request.index = 17;
        let answer = exchange(&mut hand, request);
        assert_eq!(answer.index, 17);
        assert_eq!(answer.address, 0x0C);
        let firmware = FirmwareInfo::from_payload(&answer.payload).unwrap();
        assert_eq!(firmware.text(), "SVH simulated controller");
    }

    #[test]
    fn test_disabled_channel_does_not_move() {
        let mut hand = SimulatedHand::new();
        hand.open("sim", 921_600).unwrap();
        let command = ControlCommand(10_000).to_packet(address(Command::SetControlCommand, 2));
        exchange(&mut hand, command);
        assert_eq!(hand.position(Channel::IndexFingerDistal), 0);
        assert_eq!(hand.target(Channel::IndexFingerDistal), 10_000);
    }

    #[test]
    fn test_enabled_channel_stalls_at_stop() {
        let mut hand = SimulatedHand::new();
        hand.open("sim", 921_600).unwrap();
        let state = ControllerState {
            pwm_active: Channel::ThumbFlexion.mask(),
            pwm_reset: Channel::ThumbFlexion.mask(),
            pos_ctrl: 1,
            cur_ctrl: 1,
            ..ControllerState::default()
        };
        exchange(&mut hand, state.to_packet(address(Command::SetControllerState, 0)));

        let mut last = ControllerFeedback::default();
        for _ in 0..20 {
            let answer = exchange(
                &mut hand,
                ControlCommand(1_000_000).to_packet(address(Command::SetControlCommand, 0)),
            );
            last = ControllerFeedback::from_payload(&answer.payload).unwrap();
        }
        assert_eq!(last.position, SIMULATED_STOPS.1);
        assert!((last.current - 500).abs() <= CURRENT_NOISE);
    }

    #[test]
    fn test_silent_hand() {
        let mut hand = SimulatedHand::new();
        hand.open("sim", 921_600).unwrap();
        hand.set_silent(true);
        let request = Packet::new(address(Command::GetControlFeedbackAll, 0), vec![])
            .padded(FRAME_PAYLOAD_SIZE)
            .unwrap();
        hand.write(&request.to_bytes()).unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(hand.read(&mut buf, Duration::from_millis(5)).unwrap(), 0);
        assert_eq!(hand.command_count(Command::GetControlFeedbackAll), 1);
    }
}
