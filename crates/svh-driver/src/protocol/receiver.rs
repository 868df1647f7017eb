//! Frame receiver
//!
//! Byte-at-a-time state machine that reassembles frames from the serial
//! stream. Every input byte performs exactly one transition, so the machine
//! can be fed from any read size and never waits on more input than it has.
//! Bytes that cannot belong to a frame are dropped and counted; the machine
//! always falls back to hunting for the next header.

use tracing::debug;

use super::packet::residual;
use super::{Packet, HEADER1, HEADER2, MAX_PAYLOAD_SIZE};

/// Bytes of a frame up to and including the length field
const FRAME_PREFIX: u64 = 6;

/// Receiver state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    WaitHeader1,
    WaitHeader2,
    ReadIndex,
    ReadAddress,
    ReadLengthLow,
    ReadLengthHigh,
    ReadPayload,
    ReadChecksum1,
    ReadChecksum2,
}

/// A frame that made it to the checksum stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    /// Decoded frame
    pub packet: Packet,
    /// Number of valid frames received so far, including this one if valid
    pub received_count: u32,
    /// Whether both checksums matched.
    ///
    /// Frames failing the check are still reported so the owner can see
    /// which index went bad; their payload must not be trusted.
    pub checksum_ok: bool,
}

/// Receiver counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiverStats {
    /// Valid frames received
    pub received: u32,
    /// Bytes dropped while hunting for a header or after a bad length
    pub skipped_bytes: u64,
    /// Frames discarded because of a checksum mismatch
    pub checksum_failures: u32,
}

/// Frame reassembly state machine
#[derive(Debug)]
pub struct FrameReceiver {
    state: ReceiverState,
    index: u8,
    address: u8,
    length: usize,
    payload: Vec<u8>,
    checksum1: u8,
    stats: ReceiverStats,
}

impl Default for FrameReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReceiver {
    /// Create a receiver waiting for the first header byte
    pub fn new() -> Self {
        Self {
            state: ReceiverState::WaitHeader1,
            index: 0,
            address: 0,
            length: 0,
            payload: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            checksum1: 0,
            stats: ReceiverStats::default(),
        }
    }

    /// Current state
    pub fn state(&self) -> ReceiverState {
        self.state
    }

    /// Counters since creation or the last [`reset_stats`](Self::reset_stats)
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Clear all counters
    pub fn reset_stats(&mut self) {
        self.stats = ReceiverStats::default();
    }

    /// Advance the machine by one byte.
    ///
    /// Returns the frame when `byte` was its final checksum byte.
    pub fn feed(&mut self, byte: u8) -> Option<ReceivedPacket> {
        match self.state {
            ReceiverState::WaitHeader1 => {
                if byte == HEADER1 {
                    self.state = ReceiverState::WaitHeader2;
                } else {
                    self.stats.skipped_bytes += 1;
                }
            }
            ReceiverState::WaitHeader2 => {
                if byte == HEADER2 {
                    self.state = ReceiverState::ReadIndex;
                } else if byte == HEADER1 {
                    // The previous HEADER1 was noise, this one may start a frame
                    self.stats.skipped_bytes += 1;
                } else {
                    self.stats.skipped_bytes += 2;
                    self.state = ReceiverState::WaitHeader1;
                }
            }
            ReceiverState::ReadIndex => {
                self.index = byte;
                self.state = ReceiverState::ReadAddress;
            }
            ReceiverState::ReadAddress => {
                self.address = byte;
                self.state = ReceiverState::ReadLengthLow;
            }
            ReceiverState::ReadLengthLow => {
                self.length = byte as usize;
                self.state = ReceiverState::ReadLengthHigh;
            }
            ReceiverState::ReadLengthHigh => {
                self.length |= (byte as usize) << 8;
                if self.length > MAX_PAYLOAD_SIZE {
                    debug!(
                        target: "svh::receiver",
                        length = self.length,
                        index = self.index,
                        "declared payload length exceeds frame size, resynchronizing"
                    );
                    self.stats.skipped_bytes += FRAME_PREFIX;
                    self.state = ReceiverState::WaitHeader1;
                } else {
                    self.payload.clear();
                    self.state = if self.length == 0 {
                        ReceiverState::ReadChecksum1
                    } else {
                        ReceiverState::ReadPayload
                    };
                }
            }
            ReceiverState::ReadPayload => {
                self.payload.push(byte);
                if self.payload.len() == self.length {
                    self.state = ReceiverState::ReadChecksum1;
                }
            }
            ReceiverState::ReadChecksum1 => {
                self.checksum1 = byte;
                self.state = ReceiverState::ReadChecksum2;
            }
            ReceiverState::ReadChecksum2 => {
                self.state = ReceiverState::WaitHeader1;
                return Some(self.finish_frame(byte));
            }
        }
        None
    }

    /// Feed a slice, invoking `on_packet` for every completed frame
    pub fn feed_all(&mut self, bytes: &[u8], mut on_packet: impl FnMut(ReceivedPacket)) {
        for byte in bytes {
            if let Some(received) = self.feed(*byte) {
                on_packet(received);
            }
        }
    }

    fn finish_frame(&mut self, checksum2: u8) -> ReceivedPacket {
        let (sum, xor) = residual(&self.payload, self.checksum1, checksum2);
        let checksum_ok = sum == 0 && xor == 0;

        if checksum_ok {
            self.stats.received = self.stats.received.wrapping_add(1);
        } else {
            self.stats.checksum_failures += 1;
            debug!(
                target: "svh::receiver",
                index = self.index,
                address = self.address,
                "checksum mismatch (sum residual {sum:#04x}, xor residual {xor:#04x}), frame discarded"
            );
        }

        ReceivedPacket {
            packet: Packet {
                index: self.index,
                address: self.address,
                payload: std::mem::take(&mut self.payload),
            },
            received_count: self.stats.received,
            checksum_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(receiver: &mut FrameReceiver, bytes: &[u8]) -> Vec<ReceivedPacket> {
        let mut out = Vec::new();
        receiver.feed_all(bytes, |p| out.push(p));
        out
    }

    fn sample() -> Packet {
        Packet {
            index: 42,
            address: 0x20,
            payload: vec![0x10, 0x27, 0x00, 0x00, 0xF4, 0x01],
        }
    }

    #[test]
    fn test_single_frame() {
        let mut receiver = FrameReceiver::new();
        let frames = collect(&mut receiver, &sample().to_bytes());

        assert_eq!(frames.len(), 1);
        assert!(frames[0].checksum_ok);
        assert_eq!(frames[0].packet, sample());
        assert_eq!(frames[0].received_count, 1);
        assert_eq!(receiver.state(), ReceiverState::WaitHeader1);
        assert_eq!(receiver.stats().skipped_bytes, 0);
    }

    #[test]
    fn test_one_transition_per_byte() {
        let mut receiver = FrameReceiver::new();
        let bytes = sample().to_bytes();
        let expected = [
            ReceiverState::WaitHeader2,
            ReceiverState::ReadIndex,
            ReceiverState::ReadAddress,
            ReceiverState::ReadLengthLow,
            ReceiverState::ReadLengthHigh,
            ReceiverState::ReadPayload,
        ];
        for (byte, state) in bytes.iter().zip(expected) {
            assert!(receiver.feed(*byte).is_none());
            assert_eq!(receiver.state(), state);
        }
    }

    #[test]
    fn test_resync_after_garbage() {
        let garbage = [0x00, 0x13, 0x37, 0xFF, 0xAA, 0x01];
        let mut stream = garbage.to_vec();
        stream.extend_from_slice(&sample().to_bytes());

        let mut receiver = FrameReceiver::new();
        let frames = collect(&mut receiver, &stream);

        assert_eq!(frames.len(), 1);
        assert!(frames[0].checksum_ok);
        assert_eq!(frames[0].packet, sample());
        assert_eq!(receiver.stats().skipped_bytes, garbage.len() as u64);
    }

    #[test]
    fn test_repeated_header1_keeps_sync() {
        let mut stream = vec![HEADER1, HEADER1];
        stream.extend_from_slice(&sample().to_bytes()[1..]);

        let mut receiver = FrameReceiver::new();
        let frames = collect(&mut receiver, &stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet, sample());
        assert_eq!(receiver.stats().skipped_bytes, 1);
    }

    #[test]
    fn test_broken_header_counts_both_bytes() {
        let mut stream = vec![HEADER1, 0x01];
        stream.extend_from_slice(&sample().to_bytes());

        let mut receiver = FrameReceiver::new();
        assert_eq!(collect(&mut receiver, &stream).len(), 1);
        assert_eq!(receiver.stats().skipped_bytes, 2);
    }

    #[test]
    fn test_corrupted_payload_is_rejected() {
        for offset in 0..sample().payload.len() {
            let mut bytes = sample().to_bytes();
            bytes[6 + offset] = bytes[6 + offset].wrapping_add(1);

            let mut receiver = FrameReceiver::new();
            let frames = collect(&mut receiver, &bytes);

            assert_eq!(frames.len(), 1);
            assert!(!frames[0].checksum_ok, "corruption at {offset} went unnoticed");
            assert_eq!(frames[0].packet.index, 42);
            assert_eq!(frames[0].received_count, 0);
            assert_eq!(receiver.stats().checksum_failures, 1);
            assert_eq!(receiver.stats().received, 0);
        }
    }

    #[test]
    fn test_over_length_is_a_desync() {
        let mut stream = vec![HEADER1, HEADER2, 0x01, 0x00, 0xFF, 0x00];
        stream.extend_from_slice(&sample().to_bytes());

        let mut receiver = FrameReceiver::new();
        let frames = collect(&mut receiver, &stream);

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].packet, sample());
        assert_eq!(receiver.stats().skipped_bytes, 6);
    }

    #[test]
    fn test_back_to_back_frames_and_fragmented_input() {
        let first = sample();
        let second = Packet {
            index: 43,
            address: 0x0C,
            payload: vec![],
        };
        let mut stream = first.to_bytes();
        stream.extend_from_slice(&second.to_bytes());

        let mut receiver = FrameReceiver::new();
        let mut frames = Vec::new();
        for chunk in stream.chunks(3) {
            frames.extend(collect(&mut receiver, chunk));
        }

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].packet, first);
        assert_eq!(frames[1].packet, second);
        assert_eq!(frames[1].received_count, 2);
    }
}
