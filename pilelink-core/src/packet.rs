use bytes::{Bytes, BytesMut};

use crate::error::GatewayError;
use crate::header::{self, FrameHeader, HEADER_SIZE, TRAILER_SIZE};
use crate::message::CommandCode;

/// Largest payload a frame may declare.
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// Largest complete frame on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_PAYLOAD_SIZE + TRAILER_SIZE;

/// One well-formed frame: command, sequence number and raw payload.
///
/// The payload is interpreted by [`crate::protocol`] with the session's
/// capability; the packet itself is layout-agnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    command: CommandCode,
    sequence: u16,
    payload: Bytes,
}

impl Packet {
    pub fn new(
        command: CommandCode,
        sequence: u16,
        payload: impl Into<Bytes>,
    ) -> Result<Self, GatewayError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(GatewayError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            command,
            sequence,
            payload,
        })
    }

    /// Build a packet whose payload was already bounded by the codec.
    pub(crate) fn from_parts(command: CommandCode, sequence: u16, payload: Bytes) -> Self {
        Self {
            command,
            sequence,
            payload,
        }
    }

    pub fn command(&self) -> CommandCode {
        self.command
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Size of this packet once framed.
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + TRAILER_SIZE
    }

    /// Append the complete frame, checksum included, to `dst`.
    pub fn write_to(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(self.frame_len());
        FrameHeader {
            length: self.payload.len() as u16,
            command: self.command as u8,
            sequence: self.sequence,
        }
        .write_to(dst);
        dst.extend_from_slice(&self.payload);
        let sum = header::checksum(&dst[start..]);
        dst.extend_from_slice(&sum.to_le_bytes());
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.frame_len());
        self.write_to(&mut buf);
        buf.freeze()
    }
}
