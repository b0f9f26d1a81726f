//! Frame extraction and the `tokio_util` codec built on it.
//!
//! [`decode`] is the pure contract: it looks at the head of a byte
//! buffer and either finds one complete, checksum-valid frame, asks for
//! more bytes, or tells the caller how many bytes to throw away to get
//! back in sync. [`PileCodec`] adapts it to `Framed` and yields
//! `Result<Packet, FrameError>` items so that a corrupt frame does not
//! terminate the stream.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::error::{FrameError, GatewayError};
use crate::header::{self, FRAME_MARKER, FrameHeader, HEADER_SIZE};
use crate::message::CommandCode;
use crate::packet::{MAX_PAYLOAD_SIZE, Packet};

/// Result of looking at the head of a receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered yet; consume nothing.
    Incomplete,
    /// One valid frame occupying the first `consumed` bytes.
    Frame { packet: Packet, consumed: usize },
    /// The first `discarded` bytes are garbage and must be dropped.
    Invalid { error: FrameError, discarded: usize },
}

/// Decode at most one frame from the head of `buf`.
pub fn decode(buf: &[u8], max_payload: usize) -> Decoded {
    if buf.is_empty() {
        return Decoded::Incomplete;
    }

    if buf[0] != FRAME_MARKER[0] || (buf.len() > 1 && buf[1] != FRAME_MARKER[1]) {
        return Decoded::Invalid {
            error: FrameError::MissingMarker,
            discarded: next_marker(buf, 1),
        };
    }

    let Some(header) = FrameHeader::peek(buf) else {
        return Decoded::Incomplete;
    };

    if header.length as usize > max_payload {
        return Decoded::Invalid {
            error: FrameError::LengthTooLarge {
                declared: header.length as usize,
                max: max_payload,
            },
            discarded: next_marker(buf, 1),
        };
    }

    let frame_len = header.frame_len();
    if buf.len() < frame_len {
        return Decoded::Incomplete;
    }

    let body_end = frame_len - 2;
    let carried = u16::from_le_bytes([buf[body_end], buf[body_end + 1]]);
    let computed = header::checksum(&buf[..body_end]);
    if carried != computed {
        return Decoded::Invalid {
            error: FrameError::ChecksumMismatch { carried, computed },
            discarded: next_marker(buf, 1),
        };
    }

    // The frame is intact, so an unknown command only costs this frame.
    let command = match CommandCode::try_from(header.command) {
        Ok(command) => command,
        Err(_) => {
            return Decoded::Invalid {
                error: FrameError::UnknownCommand(header.command),
                discarded: frame_len,
            };
        }
    };

    let payload = Bytes::copy_from_slice(&buf[HEADER_SIZE..body_end]);
    Decoded::Frame {
        packet: Packet::from_parts(command, header.sequence, payload),
        consumed: frame_len,
    }
}

/// Encode `packet` as one complete frame.
pub fn encode(packet: &Packet) -> Bytes {
    packet.to_bytes()
}

/// Index of the next plausible frame start at or after `from`.
///
/// A lone first marker byte at the very end counts as plausible, since
/// its second byte may still be in flight.
fn next_marker(buf: &[u8], from: usize) -> usize {
    (from..buf.len())
        .find(|&i| {
            buf[i] == FRAME_MARKER[0] && (i + 1 == buf.len() || buf[i + 1] == FRAME_MARKER[1])
        })
        .unwrap_or(buf.len())
}

// ── PileCodec ────────────────────────────────────────────────────

/// `Framed` codec for pile connections.
#[derive(Debug, Clone)]
pub struct PileCodec {
    max_payload: usize,
}

impl PileCodec {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

impl Default for PileCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for PileCodec {
    type Item = Result<Packet, FrameError>;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode(&src[..], self.max_payload) {
            Decoded::Incomplete => {
                src.reserve(HEADER_SIZE);
                Ok(None)
            }
            Decoded::Frame { packet, consumed } => {
                src.advance(consumed);
                Ok(Some(Ok(packet)))
            }
            Decoded::Invalid { error, discarded } => {
                trace!(discarded, %error, "resynchronizing");
                src.advance(discarded);
                Ok(Some(Err(error)))
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !src.is_empty() {
                    trace!(bytes = src.len(), "dropping partial frame at eof");
                    src.clear();
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<Packet> for PileCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload().len() > self.max_payload {
            return Err(GatewayError::PayloadTooLarge {
                size: item.payload().len(),
                max: self.max_payload,
            });
        }
        item.write_to(dst);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
