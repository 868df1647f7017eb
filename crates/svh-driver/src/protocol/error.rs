//! Protocol errors

use thiserror::Error;

/// Errors that can occur during communication with the hand
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Not connected to the hand")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Transport closed")]
    TransportClosed,

    #[error("Buffer overflow: payload of {0} bytes exceeds frame size")]
    BufferOverflow(usize),

    #[error("Invalid channel index: {0}")]
    InvalidChannel(u8),

    #[error("Invalid payload for {command}: expected {expected} bytes, got {actual}")]
    InvalidPayload {
        command: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Malformed frame")]
    MalformedFrame,

    #[error("Checksum mismatch: additive {sum:#04x}, xor {xor:#04x}")]
    ChecksumMismatch { sum: u8, xor: u8 },

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
