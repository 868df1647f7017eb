//! Packet encoding/decoding
//!
//! Packet format:
//! - 2 bytes: `HEADER1`, `HEADER2`
//! - 1 byte: index (wrapping send counter)
//! - 1 byte: address
//! - 2 bytes: payload length (little-endian)
//! - N bytes: payload
//! - 1 byte: checksum1, makes the mod-256 sum of payload + checksum1 zero
//! - 1 byte: checksum2, XOR of all payload bytes
//!
//! `from_bytes` decodes one complete frame and does not resynchronize; that
//! is the job of [`FrameReceiver`](super::FrameReceiver).

use byteorder::{ByteOrder, LittleEndian};

use super::{ProtocolError, HEADER1, HEADER2, MAX_PAYLOAD_SIZE};

/// Bytes surrounding the payload in an encoded frame
const FRAME_OVERHEAD: usize = 8;

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Packet {
    /// Wrapping send counter, assigned by the sender
    pub index: u8,
    /// Command id in the low nibble, channel in the high nibble
    pub address: u8,
    /// Packet payload
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a new packet with the given address and payload
    pub fn new(address: u8, payload: Vec<u8>) -> Self {
        Self {
            index: 0,
            address,
            payload,
        }
    }

    /// Pad the payload with zeros up to `size` bytes.
    ///
    /// The controller board only accepts fixed-size frames, so every packet
    /// goes through this before it is sent.
    pub fn padded(mut self, size: usize) -> Result<Self, ProtocolError> {
        if self.payload.len() > size {
            return Err(ProtocolError::BufferOverflow(self.payload.len()));
        }
        self.payload.resize(size, 0);
        Ok(self)
    }

    /// Decode a packet from one complete frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < FRAME_OVERHEAD || data[0] != HEADER1 || data[1] != HEADER2 {
            return Err(ProtocolError::MalformedFrame);
        }

        let index = data[2];
        let address = data[3];
        let length = LittleEndian::read_u16(&data[4..6]) as usize;

        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow(length));
        }
        if data.len() < FRAME_OVERHEAD + length {
            return Err(ProtocolError::MalformedFrame);
        }

        let payload = &data[6..6 + length];
        let checksum1 = data[6 + length];
        let checksum2 = data[7 + length];

        let (sum, xor) = residual(payload, checksum1, checksum2);
        if sum != 0 || xor != 0 {
            return Err(ProtocolError::ChecksumMismatch { sum, xor });
        }

        Ok(Self {
            index,
            address,
            payload: payload.to_vec(),
        })
    }

    /// Encode the packet to raw bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(HEADER1);
        bytes.push(HEADER2);
        bytes.push(self.index);
        bytes.push(self.address);

        let mut len_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut len_bytes, self.payload.len() as u16);
        bytes.extend_from_slice(&len_bytes);

        bytes.extend_from_slice(&self.payload);

        let (checksum1, checksum2) = checksums(&self.payload);
        bytes.push(checksum1);
        bytes.push(checksum2);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Compute `(checksum1, checksum2)` for a payload
pub fn checksums(payload: &[u8]) -> (u8, u8) {
    let sum = payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    let xor = payload.iter().fold(0u8, |acc, b| acc ^ b);
    (0u8.wrapping_sub(sum), xor)
}

/// What is left after folding the received checksums into the payload.
/// Both values are zero for an intact frame.
pub(crate) fn residual(payload: &[u8], checksum1: u8, checksum2: u8) -> (u8, u8) {
    let (expected1, expected2) = checksums(payload);
    (checksum1.wrapping_sub(expected1), checksum2 ^ expected2)
}

/// Builder for constructing little-endian payloads
pub struct PacketBuilder {
    address: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Create a new packet builder for the given address
    pub fn new(address: u8) -> Self {
        Self {
            address,
            payload: Vec::new(),
        }
    }

    /// Add a 16-bit unsigned value
    pub fn u16(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 16-bit signed value
    pub fn i16(mut self, value: i16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_i16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit signed value
    pub fn i32(mut self, value: i32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_i32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit unsigned value
    pub fn u32(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit float
    pub fn f32(mut self, value: f32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_f32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet::new(self.address, self.payload)
    }
}

/// Cursor over a received payload reading little-endian fields
pub struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
    command: &'static str,
}

impl<'a> PayloadReader<'a> {
    /// `command` names the payload in error messages
    pub fn new(data: &'a [u8], command: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            command,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(ProtocolError::InvalidPayload {
                command: self.command,
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.take(2).map(LittleEndian::read_u16)
    }

    pub fn i16(&mut self) -> Result<i16, ProtocolError> {
        self.take(2).map(LittleEndian::read_i16)
    }

    pub fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.take(4).map(LittleEndian::read_i32)
    }

    pub fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.take(4).map(LittleEndian::read_u32)
    }

    pub fn f32(&mut self) -> Result<f32, ProtocolError> {
        self.take(4).map(LittleEndian::read_f32)
    }

    /// Read a fixed-size byte array
    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }
}

/// A fixed-layout structure carried in a packet payload
pub trait WirePayload: Sized {
    /// Name used in error messages
    const NAME: &'static str;

    /// Append the fields to a packet under construction
    fn write(&self, builder: PacketBuilder) -> PacketBuilder;

    /// Read the fields from a payload cursor
    fn read(reader: &mut PayloadReader<'_>) -> Result<Self, ProtocolError>;

    /// Decode from the front of a payload; trailing padding is ignored
    fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        Self::read(&mut PayloadReader::new(payload, Self::NAME))
    }

    /// Build a packet for `address` carrying this value
    fn to_packet(&self, address: u8) -> Packet {
        self.write(PacketBuilder::new(address)).build()
    }
}
