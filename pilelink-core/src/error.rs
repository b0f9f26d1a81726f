//! Domain-specific error types for the pilelink gateway.
//!
//! Transport and codec failures are handled inside the connection
//! handler and never cross the registry boundary. Command failures are
//! surfaced to callers as [`CommandError`] through
//! [`CommandOutcome::into_result`](crate::dispatcher::CommandOutcome::into_result).

use std::time::Duration;
use thiserror::Error;

use crate::message::CommandCode;

/// The canonical error type for the gateway core.
#[derive(Debug, Error)]
pub enum GatewayError {
    // ── Framing / Protocol ───────────────────────────────────────
    /// Bytes on the wire did not form a valid frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// A well-formed frame arrived that is not valid for the session state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The payload of a well-formed frame could not be parsed.
    #[error("malformed {command} payload: {reason}")]
    MalformedPayload {
        command: CommandCode,
        reason: &'static str,
    },

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    // ── Connection Errors ────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// An mpsc channel was closed unexpectedly.
    #[error("channel closed")]
    ChannelClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    // ── Collaborators / Config ───────────────────────────────────
    /// The external order service failed.
    #[error("order service error: {0}")]
    OrderService(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a run of bytes was rejected by the codec.
///
/// Every variant causes the codec to discard bytes and resynchronize on
/// the next frame marker; none of them is forwarded past the codec.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Leading bytes did not start with the frame marker.
    #[error("no frame marker at stream head")]
    MissingMarker,

    /// Declared payload length exceeds the codec limit.
    #[error("declared length {declared} exceeds max {max}")]
    LengthTooLarge { declared: usize, max: usize },

    /// Checksum trailer did not match the frame contents.
    #[error("checksum mismatch: frame carried {carried:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { carried: u16, computed: u16 },

    /// Checksum verified but the command byte is not a known code.
    #[error("unknown command code {0:#04x}")]
    UnknownCommand(u8),
}

/// Typed failure of a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// No live session for the target device.
    #[error("device offline")]
    DeviceOffline,

    /// The device never acknowledged the command.
    #[error("command timed out after {attempts} attempts")]
    CommandTimeout { attempts: u32 },

    /// The command was refused before or by the device.
    #[error("command rejected: {0}")]
    Rejected(crate::dispatcher::RejectReason),

    /// The caller stopped waiting.
    #[error("command cancelled by caller")]
    Cancelled,
}

// ── Convenient From implementations ──────────────────────────────

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for GatewayError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        GatewayError::ChannelClosed
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::OrderService(e.to_string())
    }
}
