//! Start/stop charging payloads.
//!
//! ```text
//! Gateway ──[StartChargeRequest]──► Device
//!   port u8, corr_len u8, correlation
//!   extended: + energy_limit_wh u32, duration_limit_min u16
//!
//! Device  ──[StartChargeAck]──────► Gateway     (same sequence)
//!   port u8, result u8
//!
//! Gateway ──[StopChargeRequest]───► Device
//!   port u8
//!
//! Device  ──[StopChargeAck]───────► Gateway     (same sequence)
//!   port u8, result u8
//!   extended: + energy_wh u32
//! ```

use bytes::BufMut;
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::protocol::{PayloadReader, put_text};

/// Ack result byte meaning "accepted".
pub const RESULT_OK: u8 = 0;

/// Optional session limits. Zero means unlimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChargeLimits {
    pub energy_wh: Option<u32>,
    pub duration_min: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCharge {
    pub port: u8,
    pub correlation: String,
    /// Only transmitted to extended devices.
    pub limits: ChargeLimits,
}

impl StartCharge {
    pub fn decode(
        r: &mut PayloadReader<'_>,
        capability: ProtocolCapability,
    ) -> Result<Self, GatewayError> {
        let port = r.u8("port")?;
        let correlation = r.text("correlation")?;
        let limits = match capability {
            ProtocolCapability::Legacy => ChargeLimits::default(),
            ProtocolCapability::Extended => ChargeLimits {
                energy_wh: Some(r.u32("energy limit")?).filter(|v| *v != 0),
                duration_min: Some(r.u16("duration limit")?).filter(|v| *v != 0),
            },
        };
        Ok(Self {
            port,
            correlation,
            limits,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut, capability: ProtocolCapability) {
        dst.put_u8(self.port);
        put_text(dst, &self.correlation);
        if capability == ProtocolCapability::Extended {
            dst.put_u32_le(self.limits.energy_wh.unwrap_or(0));
            dst.put_u16_le(self.limits.duration_min.unwrap_or(0));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartChargeAck {
    pub port: u8,
    pub result: u8,
}

impl StartChargeAck {
    pub fn accepted(&self) -> bool {
        self.result == RESULT_OK
    }

    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        Ok(Self {
            port: r.u8("port")?,
            result: r.u8("result")?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.port);
        dst.put_u8(self.result);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopCharge {
    pub port: u8,
}

impl StopCharge {
    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        Ok(Self {
            port: r.u8("port")?,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.port);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopChargeAck {
    pub port: u8,
    pub result: u8,
    /// Energy delivered in the stopped session (extended only).
    pub energy_wh: Option<u32>,
}

impl StopChargeAck {
    pub fn accepted(&self) -> bool {
        self.result == RESULT_OK
    }

    pub fn decode(
        r: &mut PayloadReader<'_>,
        capability: ProtocolCapability,
    ) -> Result<Self, GatewayError> {
        let port = r.u8("port")?;
        let result = r.u8("result")?;
        let energy_wh = match capability {
            ProtocolCapability::Legacy => None,
            ProtocolCapability::Extended => Some(r.u32("energy")?),
        };
        Ok(Self {
            port,
            result,
            energy_wh,
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut, capability: ProtocolCapability) {
        dst.put_u8(self.port);
        dst.put_u8(self.result);
        if capability == ProtocolCapability::Extended {
            dst.put_u32_le(self.energy_wh.unwrap_or(0));
        }
    }
}
