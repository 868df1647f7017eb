use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use svh_driver::config::{ChannelRef, HandConfig};
use svh_driver::demo::SimulatedHand;
use svh_driver::hand::{
    Channel, ChannelSelect, Controller, ControllerState, CurrentSettings, HandManager,
    CHANNEL_COUNT, MAX_RESET_RETRIES,
};
use svh_driver::protocol::commands::address;
use svh_driver::protocol::{ByteTransport, Command, InterfaceConfig, Packet, WirePayload};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> HandConfig {
    HandConfig {
        inter_frame_delay_us: 0,
        read_timeout_ms: 5,
        connect_timeout_ms: 200,
        homing_cycle_ms: 1,
        homing_timeout_ms: 1_000,
        poll_interval_ms: 20,
        ..HandConfig::default()
    }
}

fn manager(hand: &SimulatedHand, config: HandConfig) -> HandManager {
    HandManager::new(Box::new(hand.clone()), config).expect("valid config")
}

/// Records every frame written to a simulated hand and can refuse
/// controller state writes after a budget is used up
#[derive(Clone)]
struct TapTransport {
    hand: SimulatedHand,
    frames: Arc<Mutex<Vec<Packet>>>,
    state_budget: Arc<Mutex<Option<u32>>>,
}

impl TapTransport {
    fn new(hand: &SimulatedHand) -> Self {
        Self {
            hand: hand.clone(),
            frames: Arc::new(Mutex::new(Vec::new())),
            state_budget: Arc::new(Mutex::new(None)),
        }
    }

    fn controller_states(&self) -> Vec<ControllerState> {
        let state_address = address(Command::SetControllerState, 0);
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.address == state_address)
            .map(|p| ControllerState::from_payload(&p.payload).unwrap())
            .collect()
    }

    fn limit_state_writes(&self, budget: Option<u32>) {
        *self.state_budget.lock().unwrap() = budget;
    }
}

impl ByteTransport for TapTransport {
    fn open(&mut self, path: &str, baud_rate: u32) -> io::Result<()> {
        self.hand.open(path, baud_rate)
    }

    fn is_open(&self) -> bool {
        self.hand.is_open()
    }

    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.hand.read(buf, timeout)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Ok(packet) = Packet::from_bytes(buf) {
            if packet.address == address(Command::SetControllerState, 0) {
                let mut budget = self.state_budget.lock().unwrap();
                match *budget {
                    Some(0) => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "refused")),
                    Some(n) => *budget = Some(n - 1),
                    None => {}
                }
            }
            self.frames.lock().unwrap().push(packet);
        }
        self.hand.write(buf)
    }

    fn close(&mut self) {
        self.hand.close();
    }

    fn try_clone(&self) -> io::Result<Box<dyn ByteTransport>> {
        self.hand.try_clone()
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_end_to_end_homing_and_positioning() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());

    assert!(manager.connect("sim"));
    assert!(manager.is_connected());
    assert!(manager.reset_channel(ChannelSelect::All));
    assert!(manager.is_homed(ChannelSelect::All));

    assert!(manager.set_target_position(Channel::ThumbFlexion, 0.1));
    assert!(manager.is_enabled(ChannelSelect::One(Channel::ThumbFlexion)));
    assert!(wait_until(Duration::from_secs(2), || {
        manager
            .get_position(Channel::ThumbFlexion)
            .is_some_and(|p| (p - 0.1).abs() < 1e-3)
    }));

    // one element out of range rejects the whole command
    let mut targets = [0.0; CHANNEL_COUNT];
    for channel in Channel::ALL {
        targets[channel.index()] = manager.get_position(channel).unwrap();
    }
    let mut rejected = targets;
    rejected[Channel::Pinky.index()] = 50.0;
    let sent_before = hand.command_count(Command::SetControlCommandAll);
    let single_before = hand.command_count(Command::SetControlCommand);
    assert!(!manager.set_all_target_positions(&rejected));
    assert_eq!(hand.command_count(Command::SetControlCommandAll), sent_before);
    assert_eq!(hand.command_count(Command::SetControlCommand), single_before);

    assert!(manager.set_all_target_positions(&targets));
    assert_eq!(hand.command_count(Command::SetControlCommandAll), sent_before + 1);
    assert!(manager.is_enabled(ChannelSelect::All));

    // with everything enabled, current limits are checked against homing
    let current = CurrentSettings::default_for(Channel::RingFinger);
    assert!(!manager.set_current_settings(Channel::RingFinger, current));
    assert!(manager.set_current_settings(Channel::RingFinger, current.scaled(0.5)));

    assert!(manager.set_max_force(0.5));
    assert!(wait_until(Duration::from_secs(1), || {
        hand.current_settings(Channel::ThumbFlexion).wmx == 250.0
    }));

    manager.disconnect();
    assert!(!manager.is_connected());
    assert!(manager.is_homed(ChannelSelect::All));
    assert_eq!(manager.get_position(Channel::ThumbFlexion), None);
}

#[test]
fn test_homing_survives_reconnect() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());
    assert!(manager.connect("sim"));
    assert!(manager.reset_channel(ChannelSelect::One(Channel::RingFinger)));
    let range = manager.get_position_range(Channel::RingFinger);
    let diagnostics = manager.get_diagnostic_status(Channel::RingFinger);

    manager.disconnect();
    assert!(manager.is_homed(ChannelSelect::One(Channel::RingFinger)));
    assert!(!manager.set_target_position(Channel::RingFinger, 0.2));

    assert!(manager.connect("sim"));
    assert!(manager.is_homed(ChannelSelect::One(Channel::RingFinger)));
    assert_eq!(manager.get_position_range(Channel::RingFinger), range);
    assert_eq!(manager.get_diagnostic_status(Channel::RingFinger), diagnostics);
    assert!(manager.set_target_position(Channel::RingFinger, 0.2));
}

#[test]
fn test_reset_all_retries_a_failing_channel() {
    init_logging();
    let hand = SimulatedHand::new();
    hand.jam(Channel::RingFinger);
    let mut manager = manager(
        &hand,
        HandConfig {
            homing_timeout_ms: 200,
            ..fast_config()
        },
    );
    assert!(manager.connect("sim"));

    let before = hand.command_count(Command::SetCurrentSettings);
    assert!(!manager.reset_channel(ChannelSelect::All));
    let attempts = hand.command_count(Command::SetCurrentSettings) - before;

    // every homing attempt installs the current settings once
    assert_eq!(attempts, 8 + 1 + MAX_RESET_RETRIES);
    assert!(!manager.is_homed(ChannelSelect::All));
    assert!(!manager.is_homed(ChannelSelect::One(Channel::RingFinger)));
    for channel in Channel::ALL.into_iter().filter(|c| *c != Channel::RingFinger) {
        assert!(manager.is_homed(ChannelSelect::One(channel)), "{channel}");
    }
}

#[test]
fn test_enable_requires_homing() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());
    assert!(manager.connect("sim"));

    let states_before = hand.command_count(Command::SetControllerState);
    assert!(!manager.enable_channel(ChannelSelect::One(Channel::ThumbFlexion)));
    assert!(!manager.enable_channel(ChannelSelect::All));
    assert!(!manager.is_enabled(ChannelSelect::One(Channel::ThumbFlexion)));
    assert_eq!(hand.command_count(Command::SetControllerState), states_before);
    assert_eq!(hand.controller_state().pwm_active, 0);
}

#[test]
fn test_accepted_targets_stay_within_soft_limits() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());
    assert!(manager.connect("sim"));
    assert!(manager.reset_channel(ChannelSelect::One(Channel::IndexFingerProximal)));

    let range = manager
        .get_position_range(Channel::IndexFingerProximal)
        .expect("homed channel has a range");
    let mut sent = hand.command_count(Command::SetControlCommand);

    for step in -10..=30 {
        let rad = step as f64 * 0.05;
        let ticks = range.rad_to_ticks(rad);
        let accepted = manager.set_target_position(Channel::IndexFingerProximal, rad);
        assert_eq!(accepted, range.contains(ticks), "{rad} rad -> {ticks} ticks");

        let now = hand.command_count(Command::SetControlCommand);
        if accepted {
            assert_eq!(now, sent + 1);
            assert_eq!(hand.target(Channel::IndexFingerProximal) as i64, ticks);
        } else {
            assert_eq!(now, sent);
        }
        sent = now;
    }
}

#[test]
fn test_switched_off_channel_is_transparent() {
    init_logging();
    let hand = SimulatedHand::new();
    let config = HandConfig {
        disabled_channels: vec![ChannelRef::Name(Channel::Pinky)],
        ..fast_config()
    };
    let mut manager = manager(&hand, config);

    assert!(manager.is_homed(ChannelSelect::One(Channel::Pinky)));
    assert!(manager.is_enabled(ChannelSelect::One(Channel::Pinky)));
    assert!(manager.set_target_position(Channel::Pinky, 0.3));
    assert_eq!(hand.command_count(Command::SetControlCommand), 0);

    assert!(manager.connect("sim"));
    assert!(manager.reset_channel(ChannelSelect::One(Channel::Pinky)));
    assert!(manager.enable_channel(ChannelSelect::One(Channel::Pinky)));
    assert!(manager.set_target_position(Channel::Pinky, 0.3));
    assert_eq!(hand.command_count(Command::SetControlCommand), 0);
    assert_eq!(hand.controller_state().pwm_active, 0);
    assert_eq!(hand.position(Channel::Pinky), 0);
}

#[test]
fn test_homing_times_out_on_jammed_channel() {
    init_logging();
    let hand = SimulatedHand::new();
    hand.jam(Channel::ThumbFlexion);
    let timeout = Duration::from_millis(300);
    let mut manager = manager(
        &hand,
        HandConfig {
            homing_timeout_ms: timeout.as_millis() as u64,
            ..fast_config()
        },
    );
    assert!(manager.connect("sim"));

    let started = Instant::now();
    assert!(!manager.reset_channel(ChannelSelect::One(Channel::ThumbFlexion)));
    let elapsed = started.elapsed();

    assert!(elapsed >= timeout, "gave up after {elapsed:?}");
    assert!(elapsed < timeout + Duration::from_millis(500), "took {elapsed:?}");
    assert!(!manager.is_homed(ChannelSelect::One(Channel::ThumbFlexion)));
    assert!(!manager.is_enabled(ChannelSelect::One(Channel::ThumbFlexion)));
    assert!(!manager.set_target_position(Channel::ThumbFlexion, 0.1));
}

#[test]
fn test_connect_fails_fast_when_silent() {
    init_logging();
    let hand = SimulatedHand::new();
    hand.set_silent(true);
    let mut manager = manager(&hand, fast_config());

    assert!(!manager.connect_with_retries("sim", 3));
    assert!(!manager.is_connected());
    // one attempt only: nine feedback requests
    assert_eq!(hand.command_count(Command::GetControlFeedback), CHANNEL_COUNT as u32);
}

#[test]
fn test_connect_retries_on_lossy_link() {
    init_logging();
    let hand = SimulatedHand::new();
    hand.drop_every(Some(4));
    let mut manager = manager(&hand, fast_config());

    assert!(!manager.connect_with_retries("sim", 2));
    assert_eq!(
        hand.command_count(Command::GetControlFeedback),
        3 * CHANNEL_COUNT as u32
    );

    hand.drop_every(None);
    assert!(manager.connect_with_retries("sim", 2));
}

#[test]
fn test_corrupted_answers_are_counted_and_ignored() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());
    assert!(manager.connect("sim"));

    hand.corrupt_every(Some(2));
    for _ in 0..10 {
        assert!(manager.controller().request_feedback(Channel::RingFinger).is_ok());
    }
    assert!(wait_until(Duration::from_secs(1), || {
        manager.receiver_stats().checksum_failures >= 5
    }));
    assert!(manager.controller().bad_packet_count() >= 5);
    assert!(manager.controller().last_bad_index().is_some());
    assert_eq!(manager.get_feedback(Channel::RingFinger).position, 0);
}

#[test]
fn test_firmware_info() {
    init_logging();
    let hand = SimulatedHand::new();
    let mut manager = manager(&hand, fast_config());
    assert!(manager.get_firmware_info().is_empty());

    assert!(manager.connect("sim"));
    let info = manager.get_firmware_info();
    assert_eq!(&info.id, b"SVH\0");
    assert_eq!(info.text(), "SVH simulated controller");
    assert!(manager.request_firmware_info());
}

#[test]
fn test_enable_sequence_order() {
    init_logging();
    let hand = SimulatedHand::new();
    let tap = TapTransport::new(&hand);
    let controller = Controller::new(
        Box::new(tap.clone()),
        InterfaceConfig {
            read_timeout: Duration::from_millis(5),
            inter_frame_delay: Duration::ZERO,
            ..InterfaceConfig::default()
        },
        tracing::Span::none(),
    );
    controller.connect("sim").unwrap();

    let mask = Channel::Pinky.mask();
    controller.enable_channel(Channel::Pinky).unwrap();
    let states = tap.controller_states();
    assert_eq!(states.len(), 3);

    // faults cleared first, nothing powered yet
    assert_eq!((states[0].pwm_fault, states[0].pwm_otw), (0x1F, 0x1F));
    assert_eq!(states[0].pwm_active, 0);
    assert_eq!(states[0].pos_ctrl, 0);
    // then the channel's bridge
    assert_eq!((states[1].pwm_reset, states[1].pwm_active), (mask, mask));
    assert_eq!((states[1].pos_ctrl, states[1].cur_ctrl), (0, 0));
    // then the controllers
    assert_eq!((states[2].pos_ctrl, states[2].cur_ctrl), (1, 1));
    assert_eq!(states[2].pwm_active, mask);
    assert_eq!(hand.controller_state(), states[2]);
    assert!(controller.is_enabled(Channel::Pinky));

    controller.disable_channel(Channel::Pinky).unwrap();
    let last = *tap.controller_states().last().unwrap();
    assert_eq!(last.pwm_active, 0);
    assert_eq!((last.pos_ctrl, last.cur_ctrl), (0, 0));
    assert!(!controller.is_enabled(Channel::Pinky));
}

#[test]
fn test_failed_enable_leaves_nothing_powered() {
    init_logging();
    let hand = SimulatedHand::new();
    let tap = TapTransport::new(&hand);
    let mut manager = HandManager::new(Box::new(tap.clone()), fast_config()).unwrap();
    assert!(manager.connect("sim"));
    assert!(manager.reset_channel(ChannelSelect::All));

    let mut targets = [0.0; CHANNEL_COUNT];
    for channel in Channel::ALL {
        targets[channel.index()] = manager.get_position(channel).unwrap();
    }

    // first channel enables fully, the second fails halfway
    tap.limit_state_writes(Some(4));
    let sent_before = hand.command_count(Command::SetControlCommandAll);
    assert!(!manager.set_all_target_positions(&targets));
    assert_eq!(hand.command_count(Command::SetControlCommandAll), sent_before);
    for channel in Channel::ALL {
        assert!(!manager.is_enabled(ChannelSelect::One(channel)), "{channel}");
    }

    tap.limit_state_writes(None);
    assert!(manager.set_all_target_positions(&targets));
    assert!(manager.is_enabled(ChannelSelect::All));
}
