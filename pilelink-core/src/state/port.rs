//! Per-port state cached by a device session.

use serde::Serialize;

use crate::protocol::{PortMetrics, PortReport, PortStatus};

/// Last known state of one charging port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortState {
    /// 1-based port index.
    pub index: u8,
    pub status: PortStatus,
    /// Order correlation of the charging session on this port.
    pub correlation: Option<String>,
    pub metrics: Option<PortMetrics>,
}

impl PortState {
    pub fn new(index: u8) -> Self {
        Self {
            index,
            status: PortStatus::Idle,
            correlation: None,
            metrics: None,
        }
    }

    pub fn is_charging(&self) -> bool {
        self.status == PortStatus::Charging
    }

    /// Apply a device report. Returns the previous status if it changed.
    pub fn apply_report(&mut self, report: &PortReport) -> Option<PortStatus> {
        let previous = self.status;
        self.status = report.status;
        self.metrics = Some(report.metrics);
        if previous == PortStatus::Charging && report.status != PortStatus::Charging {
            self.correlation = None;
        }
        (previous != report.status).then_some(previous)
    }

    /// Record the order a device accepted a start request for.
    pub fn stamp_correlation(&mut self, correlation: &str) {
        self.correlation = Some(correlation.to_owned());
    }

    /// Force the port into `Disabled`.
    ///
    /// Returns the state as it was if the port was charging, so the
    /// caller can raise exactly one interruption for it.
    pub fn disable(&mut self) -> Option<PortState> {
        let interrupted = self.is_charging().then(|| self.clone());
        self.status = PortStatus::Disabled;
        self.correlation = None;
        interrupted
    }
}
