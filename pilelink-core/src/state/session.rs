//! Per-device session state machine.
//!
//! A [`DeviceSession`] is owned by exactly one connection handler. It
//! validates every decoded packet against the current [`SessionPhase`],
//! keeps the device's [`PortState`]s, and tells the handler what to do
//! next through [`SessionEffect`]s. It never touches the socket or any
//! shared structure itself.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::dispatcher::{Ack, CommandOutcome, CommandRequest};
use crate::error::GatewayError;
use crate::events::DomainEvent;
use crate::flags::{CapabilityFlags, ProtocolCapability};
use crate::message::CommandCode;
use crate::packet::Packet;
use crate::protocol::{FirmwareVersion, Login, Message, PortReport, Telemetry};
use crate::state::port::PortState;

// ── ConnectionId ─────────────────────────────────────────────────

/// Process-unique id of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── SessionPhase ─────────────────────────────────────────────────

/// Lifecycle phase of a device session.
///
/// ```text
///  Connecting ──► Authenticated ──► Active
///       │               │              │
///       ▼               ▼              ▼
///       └──────────► Closing ◄─────────┘
///                       │
///                       ▼
///                    Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// Socket accepted, waiting for Login.
    #[default]
    Connecting,
    /// Login accepted, no traffic yet.
    Authenticated,
    /// Device has sent a heartbeat or status report.
    Active,
    Closing,
    Closed,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl SessionPhase {
    /// Login has been accepted and the session is not closing.
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated | Self::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Connecting`.
    pub fn authenticate(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Connecting => {
                *self = Self::Authenticated;
                Ok(())
            }
            other => Err(GatewayError::ProtocolViolation(format!(
                "cannot authenticate in {other} phase"
            ))),
        }
    }

    /// Valid from: `Authenticated`, `Active`.
    pub fn activate(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Authenticated | Self::Active => {
                *self = Self::Active;
                Ok(())
            }
            other => Err(GatewayError::ProtocolViolation(format!(
                "cannot activate in {other} phase"
            ))),
        }
    }

    /// Valid from: `Connecting`, `Authenticated`, `Active`.
    pub fn begin_close(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Connecting | Self::Authenticated | Self::Active => {
                *self = Self::Closing;
                Ok(())
            }
            other => Err(GatewayError::ProtocolViolation(format!(
                "cannot close in {other} phase"
            ))),
        }
    }

    /// Valid from: `Closing`.
    pub fn finish_close(&mut self) -> Result<(), GatewayError> {
        match self {
            Self::Closing => {
                *self = Self::Closed;
                Ok(())
            }
            other => Err(GatewayError::ProtocolViolation(format!(
                "cannot finish close in {other} phase"
            ))),
        }
    }
}

// ── CloseReason ──────────────────────────────────────────────────

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer closed the socket.
    Disconnected,
    /// Read or write failed.
    IoError,
    /// Outbound write did not finish in time.
    WriteTimeout,
    /// No valid Login before the deadline.
    LoginTimeout,
    /// Login payload could not be parsed.
    InvalidLogin,
    /// A second Login arrived on an authenticated socket.
    RepeatedLogin,
    /// The same identity logged in on another connection.
    DuplicateLogin,
    /// Silent for longer than the heartbeat timeout.
    HeartbeatTimeout,
    /// Too many consecutive frame errors.
    FrameErrors,
    /// Too many protocol violations.
    ProtocolViolations,
    /// Gateway shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Disconnected => "disconnected",
            CloseReason::IoError => "i/o error",
            CloseReason::WriteTimeout => "write timeout",
            CloseReason::LoginTimeout => "login timeout",
            CloseReason::InvalidLogin => "invalid login",
            CloseReason::RepeatedLogin => "repeated login",
            CloseReason::DuplicateLogin => "superseded by new login",
            CloseReason::HeartbeatTimeout => "heartbeat timeout",
            CloseReason::FrameErrors => "too many frame errors",
            CloseReason::ProtocolViolations => "too many protocol violations",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

// ── DeviceInfo / DeviceSnapshot ──────────────────────────────────

/// What a device told us about itself at Login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub identity: String,
    pub pile_number: String,
    pub capability: ProtocolCapability,
    #[serde(skip)]
    pub flags: CapabilityFlags,
    pub firmware: FirmwareVersion,
    pub port_count: u8,
}

impl From<&Login> for DeviceInfo {
    fn from(login: &Login) -> Self {
        Self {
            identity: login.identity.clone(),
            pile_number: login.pile_number.clone(),
            capability: login.capability(),
            flags: login.flags,
            firmware: login.firmware,
            port_count: login.port_count,
        }
    }
}

/// Read-only view of a session, published to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub connection: ConnectionId,
    #[serde(flatten)]
    pub device: DeviceInfo,
    pub phase: SessionPhase,
    pub ports: Vec<PortState>,
    pub telemetry: Option<Telemetry>,
    /// Unsolicited or mismatched acks seen so far.
    pub anomalies: u32,
}

impl DeviceSnapshot {
    pub fn port(&self, index: u8) -> Option<&PortState> {
        self.ports.iter().find(|p| p.index == index)
    }
}

// ── SessionEffect ────────────────────────────────────────────────

/// Work the connection handler must perform after a packet.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEffect {
    /// Login accepted: install in the registry and send LoginAck.
    Authenticated(DeviceInfo),
    /// Forward to the order service.
    Event(DomainEvent),
    /// Resolve against the pending command with the packet's sequence.
    Ack(Ack),
    /// Close the connection.
    Close(CloseReason),
}

// ── DeviceSession ────────────────────────────────────────────────

#[derive(Debug)]
pub struct DeviceSession {
    connection: ConnectionId,
    phase: SessionPhase,
    device: Option<DeviceInfo>,
    ports: Vec<PortState>,
    telemetry: Option<Telemetry>,
    violations: u32,
    anomalies: u32,
    max_violations: u32,
}

impl DeviceSession {
    pub fn new(connection: ConnectionId, max_violations: u32) -> Self {
        Self {
            connection,
            phase: SessionPhase::Connecting,
            device: None,
            ports: Vec::new(),
            telemetry: None,
            violations: 0,
            anomalies: 0,
            max_violations: max_violations.max(1),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn device(&self) -> Option<&DeviceInfo> {
        self.device.as_ref()
    }

    pub fn identity(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.identity.as_str())
    }

    pub fn capability(&self) -> ProtocolCapability {
        self.device
            .as_ref()
            .map(|d| d.capability)
            .unwrap_or_default()
    }

    pub fn ports(&self) -> &[PortState] {
        &self.ports
    }

    pub fn violations(&self) -> u32 {
        self.violations
    }

    pub fn anomalies(&self) -> u32 {
        self.anomalies
    }

    /// `None` until Login has been accepted.
    pub fn snapshot(&self) -> Option<DeviceSnapshot> {
        let device = self.device.clone()?;
        Some(DeviceSnapshot {
            connection: self.connection,
            device,
            phase: self.phase,
            ports: self.ports.clone(),
            telemetry: self.telemetry,
            anomalies: self.anomalies,
        })
    }

    /// Validate and apply one decoded packet.
    pub fn on_packet(&mut self, packet: &Packet) -> Vec<SessionEffect> {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return Vec::new();
        }

        let message = match Message::decode(packet, self.capability()) {
            Ok(message) => message,
            Err(e) if packet.command() == CommandCode::Login => {
                warn!(conn = %self.connection, error = %e, "rejecting login");
                return vec![SessionEffect::Close(if self.phase.is_authenticated() {
                    CloseReason::RepeatedLogin
                } else {
                    CloseReason::InvalidLogin
                })];
            }
            Err(e) => return self.violation(e),
        };

        match (self.phase, message) {
            (SessionPhase::Connecting, Message::Login(login)) => self.authenticate(&login),
            (SessionPhase::Connecting, other) => self.violation(GatewayError::ProtocolViolation(
                format!("{} before login", other.command()),
            )),
            (_, Message::Login(_)) => {
                warn!(identity = ?self.identity(), "second login on authenticated socket");
                vec![SessionEffect::Close(CloseReason::RepeatedLogin)]
            }
            (_, Message::Heartbeat(hb)) => {
                self.activate();
                if hb.telemetry.is_some() {
                    self.telemetry = hb.telemetry;
                }
                Vec::new()
            }
            (_, Message::PortStatusReport(report)) => {
                self.activate();
                self.apply_reports(packet.sequence(), std::slice::from_ref(&report))
            }
            (_, Message::StartChargeAck(ack)) => vec![SessionEffect::Ack(Ack::StartCharge(ack))],
            (_, Message::StopChargeAck(ack)) => vec![SessionEffect::Ack(Ack::StopCharge(ack))],
            // Port entries are applied only once the ack matches a pending
            // query, in `command_resolved`.
            (_, Message::QueryStatusAck(ack)) => vec![SessionEffect::Ack(Ack::QueryStatus(ack))],
            (_, Message::Error(report)) => vec![SessionEffect::Ack(Ack::Error(report))],
            (_, other) => self.violation(GatewayError::ProtocolViolation(format!(
                "{} is not a device message",
                other.command()
            ))),
        }
    }

    /// Apply the side effects of a resolved command. `sequence` is the
    /// sequence of the ack that resolved it.
    pub fn command_resolved(
        &mut self,
        sequence: u16,
        request: &CommandRequest,
        outcome: &CommandOutcome,
    ) -> Vec<SessionEffect> {
        if matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed) {
            return Vec::new();
        }
        match (request, outcome) {
            (
                CommandRequest::StartCharge {
                    port, correlation, ..
                },
                CommandOutcome::Success(_),
            ) => {
                if let Some(state) = self.port_mut(*port) {
                    state.stamp_correlation(correlation);
                }
                Vec::new()
            }
            (_, CommandOutcome::Success(Ack::QueryStatus(ack))) => {
                self.activate();
                self.apply_reports(sequence, &ack.ports)
            }
            _ => Vec::new(),
        }
    }

    /// Count a non-fatal protocol anomaly.
    pub fn record_anomaly(&mut self) {
        self.anomalies += 1;
    }

    /// Close the session. Returns the reconciliation events.
    ///
    /// Every port becomes `Disabled`; each port that was charging yields
    /// one `ChargeInterrupted`. Calling this again returns nothing.
    pub fn close(&mut self, reason: CloseReason) -> Vec<DomainEvent> {
        if self.phase.begin_close().is_err() {
            return Vec::new();
        }
        let mut events = Vec::new();
        if let Some(device) = &self.device {
            for port in &mut self.ports {
                if let Some(prior) = port.disable() {
                    events.push(DomainEvent::ChargeInterrupted {
                        identity: device.identity.clone(),
                        pile_number: device.pile_number.clone(),
                        session: self.connection,
                        port: prior.index,
                        correlation: prior.correlation,
                        metrics: prior.metrics,
                        reason,
                    });
                }
            }
            events.push(DomainEvent::DeviceOffline {
                identity: device.identity.clone(),
                pile_number: device.pile_number.clone(),
                session: self.connection,
                reason,
            });
            info!(
                identity = %device.identity,
                conn = %self.connection,
                %reason,
                interrupted = events.len() - 1,
                "session closed"
            );
        }
        let _ = self.phase.finish_close();
        events
    }

    // ── Internals ────────────────────────────────────────────────

    fn authenticate(&mut self, login: &Login) -> Vec<SessionEffect> {
        if let Err(e) = self.phase.authenticate() {
            return self.violation(e);
        }
        let device = DeviceInfo::from(login);
        self.ports = (1..=device.port_count).map(PortState::new).collect();
        info!(
            identity = %device.identity,
            pile = %device.pile_number,
            capability = %device.capability,
            firmware = %device.firmware,
            ports = device.port_count,
            "device authenticated"
        );
        let online = DomainEvent::DeviceOnline {
            identity: device.identity.clone(),
            pile_number: device.pile_number.clone(),
            session: self.connection,
            capability: device.capability,
            firmware: device.firmware,
            port_count: device.port_count,
        };
        self.device = Some(device.clone());
        vec![
            SessionEffect::Authenticated(device),
            SessionEffect::Event(online),
        ]
    }

    fn activate(&mut self) {
        if self.phase == SessionPhase::Authenticated {
            debug!(identity = ?self.identity(), "session active");
        }
        let _ = self.phase.activate();
    }

    fn apply_reports(&mut self, sequence: u16, reports: &[PortReport]) -> Vec<SessionEffect> {
        let mut effects = Vec::new();
        for report in reports {
            let Some(device) = self.device.clone() else {
                break;
            };
            if !self.ports.iter().any(|p| p.index == report.port) {
                effects.extend(self.violation(GatewayError::ProtocolViolation(format!(
                    "report for unknown port {}",
                    report.port
                ))));
                continue;
            }
            let Some(state) = self.port_mut(report.port) else {
                continue;
            };
            let correlation = state.correlation.clone();
            if let Some(previous) = state.apply_report(report) {
                debug!(
                    identity = %device.identity,
                    port = report.port,
                    %previous,
                    status = %report.status,
                    "port status changed"
                );
                effects.push(SessionEffect::Event(DomainEvent::PortStatusChanged {
                    identity: device.identity,
                    pile_number: device.pile_number,
                    session: self.connection,
                    sequence,
                    port: report.port,
                    previous,
                    status: report.status,
                    metrics: report.metrics,
                    correlation,
                }));
            }
        }
        effects
    }

    fn port_mut(&mut self, index: u8) -> Option<&mut PortState> {
        self.ports.iter_mut().find(|p| p.index == index)
    }

    fn violation(&mut self, error: GatewayError) -> Vec<SessionEffect> {
        self.violations += 1;
        warn!(
            identity = ?self.identity(),
            conn = %self.connection,
            count = self.violations,
            %error,
            "protocol violation"
        );
        if self.violations >= self.max_violations {
            vec![SessionEffect::Close(CloseReason::ProtocolViolations)]
        } else {
            Vec::new()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
