//! Wire command codes.
//!
//! Unknown codes decode to `GatewayError::UnknownVariant` via `TryFrom`.

use crate::error::GatewayError;
use std::fmt;

/// Every command understood by the pile protocol.
///
/// Organized by direction:
/// - `0x01..0x0F`: device-initiated (login, telemetry)
/// - `0x10..0x1F`: gateway requests
/// - `0x81..0x9F`: replies (`request | 0x80`)
/// - `0x7F`: error report
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandCode {
    // ── Device → gateway ─────────────────────────────────────────
    /// Device announces its identity and capabilities.
    Login = 0x01,
    /// Periodic keep-alive, optionally carrying telemetry.
    Heartbeat = 0x02,
    /// Unsolicited report of one port's status and metrics.
    PortStatusReport = 0x03,

    // ── Gateway → device ─────────────────────────────────────────
    /// Start charging on a port.
    StartChargeRequest = 0x10,
    /// Stop charging on a port.
    StopChargeRequest = 0x11,
    /// Ask for current port status.
    QueryStatusRequest = 0x12,

    // ── Replies ──────────────────────────────────────────────────
    /// Gateway's reply to `Login`.
    LoginAck = 0x81,
    /// Device's reply to `StartChargeRequest`.
    StartChargeAck = 0x90,
    /// Device's reply to `StopChargeRequest`.
    StopChargeAck = 0x91,
    /// Device's reply to `QueryStatusRequest`.
    QueryStatusAck = 0x92,

    /// Error report carrying a reason code.
    Error = 0x7F,
}

impl TryFrom<u8> for CommandCode {
    type Error = GatewayError;

    fn try_from(value: u8) -> Result<Self, GatewayError> {
        match value {
            0x01 => Ok(CommandCode::Login),
            0x02 => Ok(CommandCode::Heartbeat),
            0x03 => Ok(CommandCode::PortStatusReport),

            0x10 => Ok(CommandCode::StartChargeRequest),
            0x11 => Ok(CommandCode::StopChargeRequest),
            0x12 => Ok(CommandCode::QueryStatusRequest),

            0x81 => Ok(CommandCode::LoginAck),
            0x90 => Ok(CommandCode::StartChargeAck),
            0x91 => Ok(CommandCode::StopChargeAck),
            0x92 => Ok(CommandCode::QueryStatusAck),

            0x7F => Ok(CommandCode::Error),

            _ => Err(GatewayError::UnknownVariant {
                type_name: "CommandCode",
                value: value as u64,
            }),
        }
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl CommandCode {
    /// Returns `true` for device acknowledgments of gateway requests.
    pub fn is_command_ack(&self) -> bool {
        matches!(
            self,
            CommandCode::StartChargeAck | CommandCode::StopChargeAck | CommandCode::QueryStatusAck
        )
    }

    /// The ack code a device answers this request with.
    pub fn ack_code(&self) -> Option<CommandCode> {
        match self {
            CommandCode::StartChargeRequest => Some(CommandCode::StartChargeAck),
            CommandCode::StopChargeRequest => Some(CommandCode::StopChargeAck),
            CommandCode::QueryStatusRequest => Some(CommandCode::QueryStatusAck),
            _ => None,
        }
    }

    /// The request an ack code answers.
    pub fn request_code(&self) -> Option<CommandCode> {
        match self {
            CommandCode::StartChargeAck => Some(CommandCode::StartChargeRequest),
            CommandCode::StopChargeAck => Some(CommandCode::StopChargeRequest),
            CommandCode::QueryStatusAck => Some(CommandCode::QueryStatusRequest),
            _ => None,
        }
    }
}
