//! Heartbeat and port status payloads.
//!
//! # Layouts
//!
//! ```text
//! Heartbeat      legacy:   (empty)
//!                extended: signal u8, temperature i8
//!
//! Port entry     legacy:   port u8, status u8, voltage_dv u16,
//!                          current_ca u16, energy_wh u32
//!                extended: legacy fields, power_w u32, timestamp u32
//! ```
//!
//! A port entry is the whole `PortStatusReport` payload and is repeated
//! inside `QueryStatusAck`.

use bytes::BufMut;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::protocol::PayloadReader;

// ── PortStatus ───────────────────────────────────────────────────

/// Operational status of one charging port.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    #[default]
    Idle = 0,
    Charging = 1,
    Fault = 2,
    Disabled = 3,
}

impl TryFrom<u8> for PortStatus {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PortStatus::Idle),
            1 => Ok(PortStatus::Charging),
            2 => Ok(PortStatus::Fault),
            3 => Ok(PortStatus::Disabled),
            _ => Err(GatewayError::UnknownVariant {
                type_name: "PortStatus",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ── PortMetrics ──────────────────────────────────────────────────

/// Electrical readings as reported by the device, in device units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortMetrics {
    /// Voltage in decivolts.
    pub voltage_dv: u16,
    /// Current in centiamps.
    pub current_ca: u16,
    /// Instantaneous power in watts (extended only).
    pub power_w: Option<u32>,
    /// Session energy in watt-hours.
    pub energy_wh: u32,
    /// Device clock at measurement, seconds (extended only).
    pub device_timestamp: Option<u32>,
}

// ── PortReport ───────────────────────────────────────────────────

/// One port's status and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortReport {
    pub port: u8,
    pub status: PortStatus,
    pub metrics: PortMetrics,
}

impl PortReport {
    /// Encoded size for `capability`.
    pub fn encoded_len(capability: ProtocolCapability) -> usize {
        match capability {
            ProtocolCapability::Legacy => 10,
            ProtocolCapability::Extended => 18,
        }
    }

    pub fn decode(
        r: &mut PayloadReader<'_>,
        capability: ProtocolCapability,
    ) -> Result<Self, GatewayError> {
        let port = r.u8("port")?;
        let status = PortStatus::try_from(r.u8("status")?)
            .map_err(|_| r.malformed("unknown port status"))?;
        let voltage_dv = r.u16("voltage")?;
        let current_ca = r.u16("current")?;
        let energy_wh = r.u32("energy")?;
        let (power_w, device_timestamp) = match capability {
            ProtocolCapability::Legacy => (None, None),
            ProtocolCapability::Extended => (Some(r.u32("power")?), Some(r.u32("timestamp")?)),
        };
        Ok(Self {
            port,
            status,
            metrics: PortMetrics {
                voltage_dv,
                current_ca,
                power_w,
                energy_wh,
                device_timestamp,
            },
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut, capability: ProtocolCapability) {
        dst.put_u8(self.port);
        dst.put_u8(self.status as u8);
        dst.put_u16_le(self.metrics.voltage_dv);
        dst.put_u16_le(self.metrics.current_ca);
        dst.put_u32_le(self.metrics.energy_wh);
        if capability == ProtocolCapability::Extended {
            dst.put_u32_le(self.metrics.power_w.unwrap_or(0));
            dst.put_u32_le(self.metrics.device_timestamp.unwrap_or(0));
        }
    }
}

// ── Heartbeat ────────────────────────────────────────────────────

/// Signal quality and board temperature from an extended heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    pub signal: u8,
    pub temperature_c: i8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub telemetry: Option<Telemetry>,
}

impl Heartbeat {
    pub fn decode(
        r: &mut PayloadReader<'_>,
        capability: ProtocolCapability,
    ) -> Result<Self, GatewayError> {
        // Extended devices may still send a bare heartbeat.
        if capability == ProtocolCapability::Legacy || r.remaining() == 0 {
            return Ok(Self::default());
        }
        Ok(Self {
            telemetry: Some(Telemetry {
                signal: r.u8("signal")?,
                temperature_c: r.i8("temperature")?,
            }),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut, capability: ProtocolCapability) {
        if let (ProtocolCapability::Extended, Some(t)) = (capability, self.telemetry) {
            dst.put_u8(t.signal);
            dst.put_i8(t.temperature_c);
        }
    }
}
