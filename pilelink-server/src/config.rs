//! Configuration file for the gateway service.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use pilelink_core::{GatewayConfig, MAX_PAYLOAD_SIZE, RetryPolicy};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener settings.
    pub network: NetworkConfig,
    /// Login and liveness timing.
    pub session: SessionConfig,
    /// Command retries and timeouts.
    pub commands: CommandConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address devices connect to.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent device sockets.
    pub max_connections: usize,
    /// Largest accepted payload in bytes.
    pub max_payload: usize,
    /// Seconds a single socket write may block.
    pub write_timeout_secs: u64,
    /// Outbound packets queued per connection.
    pub outbound_queue: usize,
}

/// Session timing and error thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a new socket has to log in.
    pub login_deadline_secs: u64,
    /// Seconds of silence before a device is evicted.
    pub heartbeat_timeout_secs: u64,
    /// Heartbeat interval announced to devices.
    pub heartbeat_interval_secs: u64,
    /// Supervisor scan period in milliseconds.
    pub supervisor_tick_ms: u64,
    /// Consecutive undecodable frames before closing.
    pub max_frame_errors: u32,
    /// Protocol violations before closing.
    pub max_protocol_violations: u32,
}

/// Outbound command settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Retransmissions after the first attempt.
    pub max_retries: u32,
    /// Milliseconds to wait for an ack per attempt.
    pub attempt_timeout_ms: u64,
    /// Base delay between attempts in milliseconds, doubled each retry.
    pub backoff_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Colourise terminal output.
    pub ansi: bool,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        let core = GatewayConfig::default();
        Self {
            listen_addr: core.listen_addr,
            max_connections: core.max_connections,
            max_payload: MAX_PAYLOAD_SIZE,
            write_timeout_secs: core.write_timeout.as_secs(),
            outbound_queue: core.outbound_queue,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let core = GatewayConfig::default();
        Self {
            login_deadline_secs: core.login_deadline.as_secs(),
            heartbeat_timeout_secs: core.heartbeat_timeout.as_secs(),
            heartbeat_interval_secs: core.heartbeat_interval.as_secs(),
            supervisor_tick_ms: core.supervisor_tick.as_millis() as u64,
            max_frame_errors: core.max_frame_errors,
            max_protocol_violations: core.max_protocol_violations,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries,
            attempt_timeout_ms: policy.attempt_timeout.as_millis() as u64,
            backoff_ms: policy.backoff.as_millis() as u64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            ansi: true,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ServerConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// Runtime settings for the gateway core.
    pub fn to_gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            listen_addr: self.network.listen_addr,
            login_deadline: Duration::from_secs(self.session.login_deadline_secs),
            heartbeat_timeout: Duration::from_secs(self.session.heartbeat_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.session.heartbeat_interval_secs),
            supervisor_tick: Duration::from_millis(self.session.supervisor_tick_ms),
            retry: RetryPolicy {
                max_retries: self.commands.max_retries,
                attempt_timeout: Duration::from_millis(self.commands.attempt_timeout_ms),
                backoff: Duration::from_millis(self.commands.backoff_ms),
            },
            max_connections: self.network.max_connections,
            write_timeout: Duration::from_secs(self.network.write_timeout_secs),
            outbound_queue: self.network.outbound_queue,
            max_frame_errors: self.session.max_frame_errors,
            max_protocol_violations: self.session.max_protocol_violations,
            max_payload: self.network.max_payload.min(MAX_PAYLOAD_SIZE),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
