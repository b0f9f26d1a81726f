//! Domain events and the order-service boundary.
//!
//! Sessions raise [`DomainEvent`]s; connection handlers push them into an
//! [`EventSink`] and never wait on the collaborator. A single notifier
//! task drains the sink and hands each event to the [`OrderService`],
//! retrying failed deliveries a bounded number of times.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::protocol::{FirmwareVersion, PortMetrics, PortStatus};
use crate::state::{CloseReason, ConnectionId};

// ── DomainEvent ──────────────────────────────────────────────────

/// Something the order system needs to know about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    DeviceOnline {
        identity: String,
        pile_number: String,
        session: ConnectionId,
        capability: ProtocolCapability,
        firmware: FirmwareVersion,
        port_count: u8,
    },
    DeviceOffline {
        identity: String,
        pile_number: String,
        session: ConnectionId,
        reason: CloseReason,
    },
    PortStatusChanged {
        identity: String,
        pile_number: String,
        session: ConnectionId,
        /// Sequence of the packet that carried the report.
        sequence: u16,
        port: u8,
        previous: PortStatus,
        status: PortStatus,
        metrics: PortMetrics,
        correlation: Option<String>,
    },
    /// A port was charging when its session was force-closed.
    ChargeInterrupted {
        identity: String,
        pile_number: String,
        session: ConnectionId,
        port: u8,
        correlation: Option<String>,
        metrics: Option<PortMetrics>,
        reason: CloseReason,
    },
}

impl DomainEvent {
    pub fn identity(&self) -> &str {
        match self {
            DomainEvent::DeviceOnline { identity, .. }
            | DomainEvent::DeviceOffline { identity, .. }
            | DomainEvent::PortStatusChanged { identity, .. }
            | DomainEvent::ChargeInterrupted { identity, .. } => identity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::DeviceOnline { .. } => "device_online",
            DomainEvent::DeviceOffline { .. } => "device_offline",
            DomainEvent::PortStatusChanged { .. } => "port_status_changed",
            DomainEvent::ChargeInterrupted { .. } => "charge_interrupted",
        }
    }

    /// Stable key for at-least-once delivery.
    ///
    /// Built from identity, session and packet sequence, plus the
    /// device timestamp when the report carried one.
    pub fn idempotency_key(&self) -> String {
        match self {
            DomainEvent::DeviceOnline {
                identity, session, ..
            } => format!("{identity}:{}:online", session.get()),
            DomainEvent::DeviceOffline {
                identity, session, ..
            } => format!("{identity}:{}:offline", session.get()),
            DomainEvent::PortStatusChanged {
                identity,
                session,
                sequence,
                port,
                metrics,
                ..
            } => match metrics.device_timestamp {
                Some(ts) => format!("{identity}:{}:port{port}:{sequence}:{ts}", session.get()),
                None => format!("{identity}:{}:port{port}:{sequence}", session.get()),
            },
            DomainEvent::ChargeInterrupted {
                identity,
                session,
                port,
                ..
            } => format!("{identity}:{}:port{port}:interrupted", session.get()),
        }
    }
}

// ── OrderService ─────────────────────────────────────────────────

/// The external order/persistence collaborator.
#[async_trait]
pub trait OrderService: Send + Sync + 'static {
    /// Correlation of the order currently active on a port, if any.
    async fn active_order(
        &self,
        pile_number: &str,
        port: u8,
    ) -> Result<Option<String>, GatewayError>;

    /// Receive one event. May be called more than once per event.
    async fn record(&self, event: &DomainEvent) -> Result<(), GatewayError>;
}

/// Writes every event as a JSON log line and knows no orders.
#[derive(Debug, Default, Clone)]
pub struct LogOrderService;

#[async_trait]
impl OrderService for LogOrderService {
    async fn active_order(
        &self,
        _pile_number: &str,
        _port: u8,
    ) -> Result<Option<String>, GatewayError> {
        Ok(None)
    }

    async fn record(&self, event: &DomainEvent) -> Result<(), GatewayError> {
        let json = serde_json::to_string(event)?;
        info!(
            target: "pilelink::events",
            key = %event.idempotency_key(),
            event = %json,
            "domain event"
        );
        Ok(())
    }
}

// ── EventSink / notifier ─────────────────────────────────────────

/// Non-blocking handle for raising events.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: DomainEvent) {
        debug!(kind = event.kind(), identity = event.identity(), "event raised");
        if self.tx.send(event).is_err() {
            warn!("event notifier stopped; dropping event");
        }
    }
}

/// Delivery attempts per event before it is dropped.
pub const DELIVERY_ATTEMPTS: u32 = 3;

/// Spawn the notifier. It ends when every [`EventSink`] is dropped.
pub fn spawn_notifier(
    orders: Arc<dyn OrderService>,
    mut rx: mpsc::UnboundedReceiver<DomainEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            deliver(orders.as_ref(), &event).await;
        }
        debug!("event notifier finished");
    })
}

async fn deliver(orders: &dyn OrderService, event: &DomainEvent) {
    for attempt in 1..=DELIVERY_ATTEMPTS {
        match orders.record(event).await {
            Ok(()) => return,
            Err(e) if attempt < DELIVERY_ATTEMPTS => {
                warn!(key = %event.idempotency_key(), attempt, error = %e, "event delivery failed, retrying");
                tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
            }
            Err(e) => {
                warn!(key = %event.idempotency_key(), error = %e, "event dropped after retries");
            }
        }
    }
}
