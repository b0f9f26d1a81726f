//! Fixed-size frame header and checksum.
//!
//! ```text
//! offset  size  field
//! 0       2     marker    0x5A 0xA5
//! 2       2     length    payload byte count (u16 LE)
//! 4       1     command   command code
//! 5       2     sequence  u16 LE
//! 7       N     payload
//! 7+N     2     checksum  u16 LE, wrapping byte sum of [0, 7+N)
//! ```

use bytes::BufMut;

/// Frame start sentinel.
pub const FRAME_MARKER: [u8; 2] = [0x5A, 0xA5];

/// Bytes before the payload: marker + length + command + sequence.
pub const HEADER_SIZE: usize = 7;

/// Bytes after the payload: the checksum.
pub const TRAILER_SIZE: usize = 2;

/// Header fields as read off the wire, before checksum verification.
///
/// The command byte stays raw here; it is only interpreted once the
/// frame checksum has been verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub command: u8,
    pub sequence: u16,
}

impl FrameHeader {
    /// Read a header from the start of `bytes`.
    ///
    /// Returns `None` if fewer than [`HEADER_SIZE`] bytes are available.
    /// The caller has already checked the marker.
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            length: u16::from_le_bytes([bytes[2], bytes[3]]),
            command: bytes[4],
            sequence: u16::from_le_bytes([bytes[5], bytes[6]]),
        })
    }

    /// Total frame size implied by this header.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.length as usize + TRAILER_SIZE
    }

    /// Append marker and header fields to `dst`.
    pub fn write_to(&self, dst: &mut impl BufMut) {
        dst.put_slice(&FRAME_MARKER);
        dst.put_u16_le(self.length);
        dst.put_u8(self.command);
        dst.put_u16_le(self.sequence);
    }
}

/// 16-bit wrapping sum over every byte of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
}
