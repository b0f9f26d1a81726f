//! Gateway service lifecycle.
//!
//! Binds the device listener, runs the gateway until asked to stop and
//! then tears it down: sockets closed, pending commands failed.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use pilelink_core::{Gateway, GatewayConfig, GatewayError, LogOrderService, OrderService};

/// The top-level gateway service.
pub struct GatewayService {
    gateway: Arc<Gateway>,
    stop: CancellationToken,
}

impl GatewayService {
    /// Build the service with the logging order sink.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(config: GatewayConfig) -> Result<Self, GatewayError> {
        Self::with_orders(config, Arc::new(LogOrderService))
    }

    pub fn with_orders(
        config: GatewayConfig,
        orders: Arc<dyn OrderService>,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            gateway: Arc::new(Gateway::new(config, orders)?),
            stop: CancellationToken::new(),
        })
    }

    /// Handle other tasks can use to stop the service.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Bind the configured address and run until stopped.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let listener = self.gateway.bind().await?;
        self.run_on(listener).await
    }

    /// Run on an already-bound listener until stopped.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), GatewayError> {
        let gateway = self.gateway.clone();
        let stop = self.stop.clone();
        let watcher = tokio::spawn(async move {
            stop.cancelled().await;
            gateway.shutdown();
        });

        let result = self.gateway.run(listener).await;
        watcher.abort();
        if !self.gateway.is_shut_down() {
            self.gateway.shutdown();
        }
        info!(devices = self.gateway.registry().len(), "gateway service stopped");
        result
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.gateway.is_shut_down()
    }
}
