//! The gateway facade: owns the shared tables, accepts sockets and
//! exposes the command interface to the management plane.

use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::config::GatewayConfig;
use crate::dispatcher::{CommandOutcome, CommandRequest, Dispatcher, PendingTable};
use crate::error::GatewayError;
use crate::events::{EventSink, OrderService, spawn_notifier};
use crate::network::{ConnectionContext, ConnectionHandler};
use crate::protocol::ChargeLimits;
use crate::registry::Registry;
use crate::state::{CloseReason, DeviceSnapshot};
use crate::supervisor::Supervisor;

/// Answer to [`Gateway::query_device_status`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum DeviceStatus {
    Online(DeviceSnapshot),
    Offline,
}

pub struct Gateway {
    config: Arc<GatewayConfig>,
    registry: Arc<Registry>,
    pending: Arc<PendingTable>,
    dispatcher: Dispatcher,
    events: EventSink,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Build the gateway and start its event notifier.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: GatewayConfig, orders: Arc<dyn OrderService>) -> Result<Self, GatewayError> {
        config.validate()?;
        let pending = Arc::new(PendingTable::new());
        let registry = Arc::new(Registry::new(pending.clone()));
        let dispatcher = Dispatcher::new(registry.clone(), pending.clone(), orders.clone(), config.retry);
        let (events, rx) = EventSink::channel();
        spawn_notifier(orders, rx);
        Ok(Self {
            config: Arc::new(config),
            registry,
            pending,
            dispatcher,
            events,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        Ok(TcpListener::bind(self.config.listen_addr).await?)
    }

    fn context(&self) -> ConnectionContext {
        ConnectionContext {
            config: self.config.clone(),
            registry: self.registry.clone(),
            pending: self.pending.clone(),
            events: self.events.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Accept connections until [`shutdown`](Self::shutdown).
    pub async fn run(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let local = listener.local_addr()?;
        info!(addr = %local, "gateway listening");

        let supervisor = Supervisor::new(
            self.registry.clone(),
            self.config.heartbeat_timeout,
            self.config.supervisor_tick,
        )
        .spawn(self.shutdown.clone());
        let slots = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let Ok(permit) = slots.clone().try_acquire_owned() else {
                warn!(%peer, limit = self.config.max_connections, "connection limit reached, refusing");
                drop(stream);
                continue;
            };
            let _ = stream.set_nodelay(true);
            let ctx = self.context();
            tokio::spawn(
                async move {
                    let _permit = permit;
                    ConnectionHandler::run(stream, Some(peer), ctx).await;
                }
                .instrument(info_span!("conn", %peer)),
            );
        }

        let _ = supervisor.await;
        info!("gateway stopped");
        Ok(())
    }

    /// Serve one already-established stream on the current task.
    pub async fn serve<S>(&self, stream: S, peer: Option<SocketAddr>) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        ConnectionHandler::run(stream, peer, self.context()).await
    }

    /// Close every socket and fail every pending command.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let closed = self.registry.close_all(CloseReason::Shutdown);
        let failed = self.pending.fail_all();
        info!(closed, failed, "gateway shutting down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ── Command interface ────────────────────────────────────────

    /// Send `request` to the device with `pile_number`.
    pub async fn submit(
        &self,
        pile_number: &str,
        request: CommandRequest,
        cancel: CancellationToken,
    ) -> CommandOutcome {
        let Some(handle) = self.registry.lookup_pile(pile_number) else {
            return CommandOutcome::DeviceOffline;
        };
        self.dispatcher.submit(handle.identity(), request, cancel).await
    }

    pub async fn request_start_charge(
        &self,
        pile_number: &str,
        port: u8,
        correlation: &str,
    ) -> CommandOutcome {
        let request = CommandRequest::StartCharge {
            port,
            correlation: correlation.to_owned(),
            limits: ChargeLimits::default(),
        };
        self.submit(pile_number, request, self.shutdown.child_token())
            .await
    }

    pub async fn request_stop_charge(&self, pile_number: &str, port: u8) -> CommandOutcome {
        self.submit(
            pile_number,
            CommandRequest::StopCharge { port },
            self.shutdown.child_token(),
        )
        .await
    }

    /// Ask the device to report current status. `None` means all ports.
    pub async fn request_status_refresh(
        &self,
        pile_number: &str,
        port: Option<u8>,
    ) -> CommandOutcome {
        self.submit(
            pile_number,
            CommandRequest::QueryStatus { port },
            self.shutdown.child_token(),
        )
        .await
    }

    /// Cached state of the device, without contacting it.
    pub fn query_device_status(&self, pile_number: &str) -> DeviceStatus {
        match self.registry.lookup_pile(pile_number) {
            Some(handle) => DeviceStatus::Online(handle.snapshot()),
            None => DeviceStatus::Offline,
        }
    }

    pub fn online_devices(&self) -> Vec<DeviceSnapshot> {
        self.registry.snapshots()
    }
}
