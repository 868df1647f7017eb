//! # SVH Driver Library
//!
//! Host-side driver for the SVH nine-channel robotic hand.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - The framed, checksummed serial protocol of the hand's controller board
//! - A receiver thread that resynchronizes on a noisy link
//! - Homing of every channel against its mechanical hard stop
//! - Bounds-checked position control in radians
//! - A simulated hand for running without hardware
//!
//! ## Example
//!
//! ```rust,ignore
//! use svh_driver::prelude::*;
//!
//! let mut hand = HandManager::with_serial(HandConfig::default())?;
//! if hand.connect("/dev/ttyUSB0") && hand.reset_channel(ChannelSelect::All) {
//!     hand.set_target_position(Channel::IndexFingerProximal, 0.4);
//!     println!("{:?}", hand.get_position(Channel::IndexFingerProximal));
//! }
//! ```

pub mod config;
pub mod demo;
pub mod hand;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ConfigError, HandConfig};
    pub use crate::demo::SimulatedHand;
    pub use crate::hand::{
        Channel, ChannelSelect, CurrentSettings, DiagnosticState, HandManager, HomeSettings,
        PositionSettings,
    };
    pub use crate::protocol::{ByteTransport, ProtocolError, SerialTransport};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
