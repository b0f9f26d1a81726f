//! Heartbeat supervisor: evicts devices that went silent.
//!
//! The supervisor only asks a handle to close. The owning connection
//! handler runs its normal close path, which disables the ports and
//! raises the reconciliation events.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::Registry;
use crate::state::CloseReason;

pub struct Supervisor {
    registry: Arc<Registry>,
    timeout: Duration,
    tick: Duration,
}

impl Supervisor {
    pub fn new(registry: Arc<Registry>, timeout: Duration, tick: Duration) -> Self {
        Self {
            registry,
            timeout,
            tick,
        }
    }

    /// Close every session idle for longer than the timeout.
    pub fn sweep(&self) -> usize {
        let mut evicted = 0;
        for handle in self.registry.handles() {
            let idle = handle.idle_for();
            if idle > self.timeout && handle.close(CloseReason::HeartbeatTimeout) {
                warn!(
                    identity = handle.identity(),
                    conn = %handle.connection(),
                    idle = ?idle,
                    "heartbeat timeout, evicting"
                );
                evicted += 1;
            }
        }
        evicted
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
            debug!("supervisor stopped");
        })
    }
}
