//! Command dispatch: start/stop/query requests to devices.
//!
//! [`Dispatcher::submit`] turns a [`CommandRequest`] into a packet on the
//! device's outbound queue and waits for the matching ack. The wait is
//! bounded by the [`RetryPolicy`] and by the caller's cancellation token,
//! so every call returns a definite [`CommandOutcome`].
//!
//! ```text
//! submit ──► lookup ──► validate ──► register pending ──► send ──┐
//!                                          ▲                      │
//!                                          │  attempt timeout     ▼
//!                                          └──── backoff ◄── wait for ack
//! ```

mod pending;

pub use pending::{PendingCommand, PendingKey, PendingTable, Unmatched};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::events::OrderService;
use crate::message::CommandCode;
use crate::protocol::{
    ChargeLimits, ErrorReport, MAX_TEXT_LEN, Message, QueryStatus, QueryStatusAck, StartCharge,
    StartChargeAck, StopCharge, StopChargeAck,
};
use crate::registry::Registry;
use crate::state::DeviceSnapshot;

// ── CommandRequest ───────────────────────────────────────────────

/// A request the management plane can send to a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    StartCharge {
        port: u8,
        correlation: String,
        limits: ChargeLimits,
    },
    StopCharge {
        port: u8,
    },
    /// `None` queries every port.
    QueryStatus {
        port: Option<u8>,
    },
}

impl CommandRequest {
    pub fn code(&self) -> CommandCode {
        match self {
            CommandRequest::StartCharge { .. } => CommandCode::StartChargeRequest,
            CommandRequest::StopCharge { .. } => CommandCode::StopChargeRequest,
            CommandRequest::QueryStatus { .. } => CommandCode::QueryStatusRequest,
        }
    }

    pub fn port(&self) -> Option<u8> {
        match self {
            CommandRequest::StartCharge { port, .. } | CommandRequest::StopCharge { port } => {
                Some(*port)
            }
            CommandRequest::QueryStatus { port } => *port,
        }
    }

    pub fn to_message(&self) -> Message {
        match self {
            CommandRequest::StartCharge {
                port,
                correlation,
                limits,
            } => Message::StartChargeRequest(StartCharge {
                port: *port,
                correlation: correlation.clone(),
                limits: *limits,
            }),
            CommandRequest::StopCharge { port } => {
                Message::StopChargeRequest(StopCharge { port: *port })
            }
            CommandRequest::QueryStatus { port } => {
                Message::QueryStatusRequest(QueryStatus { port: *port })
            }
        }
    }

    /// Check the request against what the device declared at Login.
    pub fn validate(&self, device: &DeviceSnapshot) -> Result<(), RejectReason> {
        if let Some(port) = self.port() {
            if port == 0 || port > device.device.port_count {
                return Err(RejectReason::InvalidPort(port));
            }
        }
        if let CommandRequest::StartCharge { correlation, .. } = self {
            if correlation.is_empty()
                || correlation.len() > MAX_TEXT_LEN
                || !correlation.bytes().all(|b| b.is_ascii_graphic())
            {
                return Err(RejectReason::InvalidRequest("correlation must be 1-64 printable ASCII bytes"));
            }
        }
        Ok(())
    }
}

// ── Ack ──────────────────────────────────────────────────────────

/// A device reply that resolves a pending command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ack {
    StartCharge(StartChargeAck),
    StopCharge(StopChargeAck),
    QueryStatus(QueryStatusAck),
    /// `Error` packet carrying a pending command's sequence.
    Error(ErrorReport),
}

impl Ack {
    pub fn code(&self) -> CommandCode {
        match self {
            Ack::StartCharge(_) => CommandCode::StartChargeAck,
            Ack::StopCharge(_) => CommandCode::StopChargeAck,
            Ack::QueryStatus(_) => CommandCode::QueryStatusAck,
            Ack::Error(_) => CommandCode::Error,
        }
    }

    /// Device rejection code, if the device refused the command.
    pub fn rejection(&self) -> Option<u8> {
        match self {
            Ack::StartCharge(a) if !a.accepted() => Some(a.result),
            Ack::StopCharge(a) if !a.accepted() => Some(a.result),
            Ack::Error(e) => Some(e.reason),
            _ => None,
        }
    }
}

// ── Outcome ──────────────────────────────────────────────────────

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A StartCharge is already pending for this port.
    PortBusy(u8),
    /// The order system has a different order active on the port.
    OrderConflict { active: String },
    /// The order system could not be asked.
    OrderLookupFailed,
    /// Port index outside what the device declared.
    InvalidPort(u8),
    InvalidRequest(&'static str),
    /// The connection's sequence space is exhausted.
    TooManyPending,
    /// Device answered with a non-zero result or an Error packet.
    Device(u8),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::PortBusy(port) => write!(f, "start already pending on port {port}"),
            RejectReason::OrderConflict { active } => {
                write!(f, "port has active order {active}")
            }
            RejectReason::OrderLookupFailed => write!(f, "order lookup failed"),
            RejectReason::InvalidPort(port) => write!(f, "no such port {port}"),
            RejectReason::InvalidRequest(why) => write!(f, "invalid request: {why}"),
            RejectReason::TooManyPending => write!(f, "too many pending commands"),
            RejectReason::Device(code) => write!(f, "device refused with code {code}"),
        }
    }
}

/// Definite result of [`Dispatcher::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Success(Ack),
    Timeout { attempts: u32 },
    DeviceOffline,
    Rejected(RejectReason),
    Cancelled,
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Success(_))
    }

    pub fn into_result(self) -> Result<Ack, CommandError> {
        match self {
            CommandOutcome::Success(ack) => Ok(ack),
            CommandOutcome::Timeout { attempts } => Err(CommandError::CommandTimeout { attempts }),
            CommandOutcome::DeviceOffline => Err(CommandError::DeviceOffline),
            CommandOutcome::Rejected(reason) => Err(CommandError::Rejected(reason)),
            CommandOutcome::Cancelled => Err(CommandError::Cancelled),
        }
    }
}

impl From<Ack> for CommandOutcome {
    fn from(ack: Ack) -> Self {
        match ack.rejection() {
            Some(code) => CommandOutcome::Rejected(RejectReason::Device(code)),
            None => CommandOutcome::Success(ack),
        }
    }
}

// ── RetryPolicy ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Resends after the first attempt.
    pub max_retries: u32,
    /// How long to wait for an ack per attempt.
    pub attempt_timeout: Duration,
    /// Pause before the first retry; doubles per retry up to 8×.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            attempt_timeout: Duration::from_secs(5),
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Pause before retry number `retry` (1-based).
    pub fn backoff_before(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(3);
        self.backoff * (1u32 << shift)
    }
}

// ── Dispatcher ───────────────────────────────────────────────────

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    pending: Arc<PendingTable>,
    orders: Arc<dyn OrderService>,
    policy: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        pending: Arc<PendingTable>,
        orders: Arc<dyn OrderService>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            pending,
            orders,
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Send `request` to `identity` and wait for its outcome.
    pub async fn submit(
        &self,
        identity: &str,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> CommandOutcome {
        if cancel.is_cancelled() {
            return CommandOutcome::Cancelled;
        }
        let Some(handle) = self.registry.lookup(identity) else {
            debug!(identity, command = %request.code(), "device offline");
            return CommandOutcome::DeviceOffline;
        };
        if let Err(reason) = request.validate(&handle.snapshot()) {
            return CommandOutcome::Rejected(reason);
        }

        if let CommandRequest::StartCharge {
            port, correlation, ..
        } = &request
        {
            let lookup = tokio::select! {
                _ = cancel.cancelled() => return CommandOutcome::Cancelled,
                r = self.orders.active_order(handle.pile_number(), *port) => r,
            };
            match lookup {
                Ok(Some(active)) if active != *correlation => {
                    return CommandOutcome::Rejected(RejectReason::OrderConflict { active });
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(identity, port, error = %e, "order lookup failed");
                    return CommandOutcome::Rejected(RejectReason::OrderLookupFailed);
                }
            }
        }

        let sequence = handle.next_sequence();
        let packet = match request.to_message().to_packet(sequence, handle.capability()) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(identity, error = %e, "cannot encode command");
                return CommandOutcome::Rejected(RejectReason::InvalidRequest("payload too large"));
            }
        };
        let key = PendingKey {
            connection: handle.connection(),
            sequence,
        };
        let mut rx = match self.pending.register(key, identity, request.clone()) {
            Ok(rx) => rx,
            Err(reason) => return CommandOutcome::Rejected(reason),
        };
        // Closed between lookup and register: the close path may have
        // already swept the table.
        if handle.is_closed() {
            return self.settle(key, rx, CommandOutcome::DeviceOffline).await;
        }
        handle.mark_issued(request.code());

        let attempts = self.policy.attempts();
        for attempt in 1..=attempts {
            if attempt > 1 {
                self.pending.retry(key);
                let pause = self.policy.backoff_before(attempt - 1);
                tokio::select! {
                    biased;
                    res = &mut rx => return res.unwrap_or(CommandOutcome::DeviceOffline),
                    _ = cancel.cancelled() => {
                        return self.settle(key, rx, CommandOutcome::Cancelled).await;
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            debug!(identity, seq = sequence, attempt, command = %request.code(), "sending command");
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.settle(key, rx, CommandOutcome::Cancelled).await;
                }
                r = handle.send(packet.clone()) => r,
            };
            if sent.is_err() {
                return self.settle(key, rx, CommandOutcome::DeviceOffline).await;
            }

            tokio::select! {
                biased;
                res = &mut rx => return res.unwrap_or(CommandOutcome::DeviceOffline),
                _ = cancel.cancelled() => {
                    return self.settle(key, rx, CommandOutcome::Cancelled).await;
                }
                _ = tokio::time::sleep(self.policy.attempt_timeout) => {
                    warn!(identity, seq = sequence, attempt, "no ack before deadline");
                }
            }
        }

        warn!(identity, seq = sequence, attempts, command = %request.code(), "command timed out");
        self.settle(key, rx, CommandOutcome::Timeout { attempts }).await
    }

    /// Give up on `key` with `fallback`, unless it was resolved first.
    async fn settle(
        &self,
        key: PendingKey,
        rx: oneshot::Receiver<CommandOutcome>,
        fallback: CommandOutcome,
    ) -> CommandOutcome {
        if self.pending.abandon(key) {
            fallback
        } else {
            rx.await.unwrap_or(CommandOutcome::DeviceOffline)
        }
    }
}
