//! Typed payload layouts for every command code.
//!
//! Each sub-module defines the payloads for one protocol area. Layouts
//! that differ between firmware generations take a
//! [`ProtocolCapability`] argument; nothing here reads global state.
//!
//! [`Message`] ties the payloads to command codes so the session layer
//! can turn a raw [`Packet`] into a typed value in one call.

pub mod charge;
pub mod login;
pub mod query;
pub mod status;

pub use charge::{ChargeLimits, StartCharge, StartChargeAck, StopCharge, StopChargeAck};
pub use login::{FirmwareVersion, Login, LoginAck, LoginResult};
pub use query::{QueryStatus, QueryStatusAck};
pub use status::{Heartbeat, PortMetrics, PortReport, PortStatus, Telemetry};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::message::CommandCode;
use crate::packet::Packet;

/// Maximum length of identity, pile number and correlation strings.
pub const MAX_TEXT_LEN: usize = 64;

// ── Message ──────────────────────────────────────────────────────

/// A decoded payload, tagged by command.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Login(Login),
    LoginAck(LoginAck),
    Heartbeat(Heartbeat),
    PortStatusReport(PortReport),
    StartChargeRequest(StartCharge),
    StartChargeAck(StartChargeAck),
    StopChargeRequest(StopCharge),
    StopChargeAck(StopChargeAck),
    QueryStatusRequest(QueryStatus),
    QueryStatusAck(QueryStatusAck),
    Error(ErrorReport),
}

impl Message {
    /// Interpret `packet`'s payload using `capability`'s layouts.
    pub fn decode(packet: &Packet, capability: ProtocolCapability) -> Result<Self, GatewayError> {
        let mut r = PayloadReader::new(packet.command(), packet.payload());
        let msg = match packet.command() {
            CommandCode::Login => Message::Login(Login::decode(&mut r)?),
            CommandCode::LoginAck => Message::LoginAck(LoginAck::decode(&mut r)?),
            CommandCode::Heartbeat => Message::Heartbeat(Heartbeat::decode(&mut r, capability)?),
            CommandCode::PortStatusReport => {
                Message::PortStatusReport(PortReport::decode(&mut r, capability)?)
            }
            CommandCode::StartChargeRequest => {
                Message::StartChargeRequest(StartCharge::decode(&mut r, capability)?)
            }
            CommandCode::StartChargeAck => Message::StartChargeAck(StartChargeAck::decode(&mut r)?),
            CommandCode::StopChargeRequest => Message::StopChargeRequest(StopCharge::decode(&mut r)?),
            CommandCode::StopChargeAck => {
                Message::StopChargeAck(StopChargeAck::decode(&mut r, capability)?)
            }
            CommandCode::QueryStatusRequest => {
                Message::QueryStatusRequest(QueryStatus::decode(&mut r)?)
            }
            CommandCode::QueryStatusAck => {
                Message::QueryStatusAck(QueryStatusAck::decode(&mut r, capability)?)
            }
            CommandCode::Error => Message::Error(ErrorReport::decode(&mut r)?),
        };
        Ok(msg)
    }

    pub fn command(&self) -> CommandCode {
        match self {
            Message::Login(_) => CommandCode::Login,
            Message::LoginAck(_) => CommandCode::LoginAck,
            Message::Heartbeat(_) => CommandCode::Heartbeat,
            Message::PortStatusReport(_) => CommandCode::PortStatusReport,
            Message::StartChargeRequest(_) => CommandCode::StartChargeRequest,
            Message::StartChargeAck(_) => CommandCode::StartChargeAck,
            Message::StopChargeRequest(_) => CommandCode::StopChargeRequest,
            Message::StopChargeAck(_) => CommandCode::StopChargeAck,
            Message::QueryStatusRequest(_) => CommandCode::QueryStatusRequest,
            Message::QueryStatusAck(_) => CommandCode::QueryStatusAck,
            Message::Error(_) => CommandCode::Error,
        }
    }

    /// Encode into a packet with the given sequence number.
    pub fn to_packet(
        &self,
        sequence: u16,
        capability: ProtocolCapability,
    ) -> Result<Packet, GatewayError> {
        let mut buf = BytesMut::new();
        match self {
            Message::Login(m) => m.encode(&mut buf),
            Message::LoginAck(m) => m.encode(&mut buf),
            Message::Heartbeat(m) => m.encode(&mut buf, capability),
            Message::PortStatusReport(m) => m.encode(&mut buf, capability),
            Message::StartChargeRequest(m) => m.encode(&mut buf, capability),
            Message::StartChargeAck(m) => m.encode(&mut buf),
            Message::StopChargeRequest(m) => m.encode(&mut buf),
            Message::StopChargeAck(m) => m.encode(&mut buf, capability),
            Message::QueryStatusRequest(m) => m.encode(&mut buf),
            Message::QueryStatusAck(m) => m.encode(&mut buf, capability),
            Message::Error(m) => m.encode(&mut buf),
        }
        Packet::new(self.command(), sequence, buf.freeze())
    }
}

// ── ErrorReport ──────────────────────────────────────────────────

/// Payload of `CommandCode::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub reason: u8,
}

impl ErrorReport {
    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        Ok(Self {
            reason: r.u8("reason")?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.reason);
    }
}

// ── PayloadReader ────────────────────────────────────────────────

/// Bounds-checked little-endian reader over one payload.
///
/// Every short read becomes [`GatewayError::MalformedPayload`] tagged
/// with the command being parsed. Trailing bytes are left unread.
pub struct PayloadReader<'a> {
    command: CommandCode,
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(command: CommandCode, buf: &'a [u8]) -> Self {
        Self { command, buf }
    }

    pub fn command(&self) -> CommandCode {
        self.command
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn malformed(&self, reason: &'static str) -> GatewayError {
        GatewayError::MalformedPayload {
            command: self.command,
            reason,
        }
    }

    fn need(&self, n: usize, field: &'static str) -> Result<(), GatewayError> {
        if self.buf.remaining() < n {
            return Err(self.malformed(field));
        }
        Ok(())
    }

    pub fn u8(&mut self, field: &'static str) -> Result<u8, GatewayError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub fn i8(&mut self, field: &'static str) -> Result<i8, GatewayError> {
        self.need(1, field)?;
        Ok(self.buf.get_i8())
    }

    pub fn u16(&mut self, field: &'static str) -> Result<u16, GatewayError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    pub fn u32(&mut self, field: &'static str) -> Result<u32, GatewayError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    /// Length-prefixed printable ASCII string.
    pub fn text(&mut self, field: &'static str) -> Result<String, GatewayError> {
        let len = self.u8(field)? as usize;
        if len == 0 || len > MAX_TEXT_LEN {
            return Err(self.malformed(field));
        }
        self.need(len, field)?;
        let raw = &self.buf[..len];
        if !raw.iter().all(|b| b.is_ascii_graphic()) {
            return Err(self.malformed(field));
        }
        let text = String::from_utf8_lossy(raw).into_owned();
        self.buf.advance(len);
        Ok(text)
    }
}

/// Write a length-prefixed string, truncated to [`MAX_TEXT_LEN`].
pub(crate) fn put_text(dst: &mut impl BufMut, text: &str) {
    let bytes = &text.as_bytes()[..text.len().min(MAX_TEXT_LEN)];
    dst.put_u8(bytes.len() as u8);
    dst.put_slice(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reader_reports_command_and_field() {
        let mut r = PayloadReader::new(CommandCode::StartChargeAck, &[1]);
        assert_eq!(r.u8("port").unwrap(), 1);
        let err = r.u8("result").unwrap_err();
        assert_eq!(
            err.to_string(),
            "malformed StartChargeAck payload: result"
        );
    }

    #[test]
    fn text_rejects_empty_and_control_bytes() {
        let mut r = PayloadReader::new(CommandCode::Login, &[0]);
        assert!(r.text("identity").is_err());

        let mut r = PayloadReader::new(CommandCode::Login, &[2, b'A', 0x07]);
        assert!(r.text("identity").is_err());

        let mut r = PayloadReader::new(CommandCode::Login, &[3, b'A', b'B', b'C', 0xFF]);
        assert_eq!(r.text("identity").unwrap(), "ABC");
        assert_eq!(r.remaining(), 1);
    }

    #[test]
    fn message_dispatches_on_command() {
        let pkt = Message::Error(ErrorReport { reason: 4 })
            .to_packet(12, ProtocolCapability::Legacy)
            .unwrap();
        assert_eq!(pkt.command(), CommandCode::Error);
        assert_eq!(pkt.sequence(), 12);
        assert_eq!(
            Message::decode(&pkt, ProtocolCapability::Legacy).unwrap(),
            Message::Error(ErrorReport { reason: 4 })
        );
    }

    #[test]
    fn short_payload_is_malformed() {
        let pkt = Packet::new(CommandCode::StartChargeAck, 1, vec![1]).unwrap();
        assert!(matches!(
            Message::decode(&pkt, ProtocolCapability::Legacy),
            Err(GatewayError::MalformedPayload {
                command: CommandCode::StartChargeAck,
                ..
            })
        ));
    }
}
