//! Serial Protocol Communication
//!
//! Implements the framed, checksummed wire protocol spoken by the SVH hand
//! controller board.
//!
//! Frame layout (multi-byte fields little-endian):
//! - 2 bytes: header `0x4C 0xAA`
//! - 1 byte: wrapping packet index
//! - 1 byte: address (command in the low nibble, channel in the high nibble)
//! - 2 bytes: payload length
//! - N bytes: payload
//! - 1 byte: additive checksum, 1 byte: XOR checksum

pub mod commands;
mod error;
mod interface;
mod packet;
pub mod receiver;
pub mod transport;

pub use commands::Command;
pub use error::ProtocolError;
pub use interface::{InterfaceConfig, PacketHandler, SerialInterface};
pub use packet::{checksums, Packet, PacketBuilder, PayloadReader, WirePayload};
pub use receiver::{FrameReceiver, ReceivedPacket, ReceiverStats};
pub use transport::{list_ports, ByteTransport, PortInfo, SerialTransport};

use std::time::Duration;

/// First header byte of every frame
pub const HEADER1: u8 = 0x4C;

/// Second header byte of every frame
pub const HEADER2: u8 = 0xAA;

/// Fixed payload size the controller board expects on every frame it receives
pub const FRAME_PAYLOAD_SIZE: usize = 64;

/// Largest payload the receiver accepts; longer declarations are a desync
pub const MAX_PAYLOAD_SIZE: usize = 64;

/// Default baud rate of the hand's serial link
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

/// Delay after every sent frame.
/// The board drops frames that arrive back-to-back at the default baud rate.
pub const INTER_FRAME_DELAY: Duration = Duration::from_micros(782);

/// Default read timeout of the receiver loop in milliseconds
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 50;
