//! Login handshake payloads.
//!
//! ```text
//! Device  ──[Login]────► Gateway
//!   id_len u8, id, pile_len u8, pile, flags u8, port_count u8,
//!   fw_major u8, fw_minor u8
//!
//! Gateway ──[LoginAck]─► Device     (sequence echoes the Login)
//!   result u8, heartbeat_interval_s u16
//! ```
//!
//! The Login layout is the same for every capability: it is the packet
//! that tells the gateway which capability to use afterwards.

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::flags::{CapabilityFlags, ProtocolCapability};
use crate::protocol::{PayloadReader, put_text};

/// Upper bound on ports a single pile may declare.
pub const MAX_PORTS: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    /// Serial number / hardware ID.
    pub identity: String,
    /// Logical pile number used by the order system.
    pub pile_number: String,
    pub flags: CapabilityFlags,
    pub port_count: u8,
    pub firmware: FirmwareVersion,
}

impl Login {
    pub fn capability(&self) -> ProtocolCapability {
        ProtocolCapability::from(self.flags)
    }

    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        let identity = r.text("identity")?;
        let pile_number = r.text("pile number")?;
        let flags = CapabilityFlags::from_bits_retain(r.u8("flags")?);
        let port_count = r.u8("port count")?;
        if port_count == 0 || port_count > MAX_PORTS {
            return Err(r.malformed("port count out of range"));
        }
        let firmware = FirmwareVersion {
            major: r.u8("firmware major")?,
            minor: r.u8("firmware minor")?,
        };
        Ok(Self {
            identity,
            pile_number,
            flags,
            port_count,
            firmware,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        put_text(dst, &self.identity);
        put_text(dst, &self.pile_number);
        dst.put_u8(self.flags.bits());
        dst.put_u8(self.port_count);
        dst.put_u8(self.firmware.major);
        dst.put_u8(self.firmware.minor);
    }
}

/// Gateway's verdict on a Login.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginResult {
    Accepted = 0,
    Rejected = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginAck {
    pub result: LoginResult,
    /// How often the device should send heartbeats.
    pub heartbeat_interval_s: u16,
}

impl LoginAck {
    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        let result = match r.u8("result")? {
            0 => LoginResult::Accepted,
            _ => LoginResult::Rejected,
        };
        Ok(Self {
            result,
            heartbeat_interval_s: r.u16("heartbeat interval")?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.result as u8);
        dst.put_u16_le(self.heartbeat_interval_s);
    }
}
