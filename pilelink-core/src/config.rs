//! Runtime configuration of the gateway core.

use std::net::SocketAddr;
use std::time::Duration;

use crate::dispatcher::RetryPolicy;
use crate::error::GatewayError;
use crate::packet::MAX_PAYLOAD_SIZE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    /// Time a new socket has to send a valid Login.
    pub login_deadline: Duration,
    /// Silence after which the supervisor evicts a device.
    pub heartbeat_timeout: Duration,
    /// Heartbeat interval announced to devices in LoginAck.
    pub heartbeat_interval: Duration,
    pub supervisor_tick: Duration,
    pub retry: RetryPolicy,
    /// Accepts beyond this many live sockets are closed immediately.
    pub max_connections: usize,
    pub write_timeout: Duration,
    /// Per-connection outbound queue depth.
    pub outbound_queue: usize,
    /// Consecutive frame errors before a connection is dropped.
    pub max_frame_errors: u32,
    /// Protocol violations per session before it is dropped.
    pub max_protocol_violations: u32,
    pub max_payload: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9300)),
            login_deadline: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            supervisor_tick: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            max_connections: 10_000,
            write_timeout: Duration::from_secs(5),
            outbound_queue: 32,
            max_frame_errors: 5,
            max_protocol_violations: 10,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

impl GatewayConfig {
    /// Reject values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let nonzero = [
            ("login_deadline", self.login_deadline),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("supervisor_tick", self.supervisor_tick),
            ("attempt_timeout", self.retry.attempt_timeout),
            ("write_timeout", self.write_timeout),
        ];
        for (name, value) in nonzero {
            if value.is_zero() {
                return Err(GatewayError::Config(format!("{name} must be non-zero")));
            }
        }
        if self.supervisor_tick > self.heartbeat_timeout {
            return Err(GatewayError::Config(
                "supervisor_tick must not exceed heartbeat_timeout".into(),
            ));
        }
        if self.max_connections == 0 || self.outbound_queue == 0 {
            return Err(GatewayError::Config(
                "max_connections and outbound_queue must be positive".into(),
            ));
        }
        if self.max_frame_errors == 0 {
            return Err(GatewayError::Config(
                "max_frame_errors must be at least 1".into(),
            ));
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_SIZE {
            return Err(GatewayError::Config(format!(
                "max_payload must be in 1..={MAX_PAYLOAD_SIZE}"
            )));
        }
        Ok(())
    }
}
