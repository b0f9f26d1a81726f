//! Table of commands waiting for a device acknowledgment.
//!
//! Every entry is resolved exactly once: whoever removes it under the
//! lock (ack, timeout, cancellation, disconnect) owns its result.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use crate::dispatcher::{Ack, CommandOutcome, CommandRequest, RejectReason};
use crate::message::CommandCode;
use crate::state::ConnectionId;

/// Sequence numbers are scoped to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingKey {
    pub connection: ConnectionId,
    pub sequence: u16,
}

#[derive(Debug)]
pub struct PendingCommand {
    pub identity: String,
    pub request: CommandRequest,
    pub issued_at: Instant,
    pub attempt: u32,
    tx: oneshot::Sender<CommandOutcome>,
}

impl PendingCommand {
    fn resolve(self, outcome: CommandOutcome) {
        // The submitter may have stopped listening.
        let _ = self.tx.send(outcome);
    }
}

/// Why an ack could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unmatched {
    /// Nothing pending under that sequence.
    NotPending,
    /// A different command kind is pending under that sequence.
    WrongKind { pending: CommandCode },
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<PendingKey, PendingCommand>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PendingKey, PendingCommand>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a command and return the receiver for its outcome.
    ///
    /// A second StartCharge for the same identity and port is refused
    /// while the first is outstanding.
    pub fn register(
        &self,
        key: PendingKey,
        identity: &str,
        request: CommandRequest,
    ) -> Result<oneshot::Receiver<CommandOutcome>, RejectReason> {
        let mut entries = self.lock();
        if let CommandRequest::StartCharge { port, .. } = &request {
            let busy = entries.values().any(|p| {
                p.identity == identity
                    && matches!(&p.request, CommandRequest::StartCharge { port: q, .. } if q == port)
            });
            if busy {
                return Err(RejectReason::PortBusy(*port));
            }
        }
        if entries.contains_key(&key) {
            return Err(RejectReason::TooManyPending);
        }
        let (tx, rx) = oneshot::channel();
        entries.insert(
            key,
            PendingCommand {
                identity: identity.to_owned(),
                request,
                issued_at: Instant::now(),
                attempt: 1,
                tx,
            },
        );
        Ok(rx)
    }

    /// Resolve the entry under `key` with a device ack.
    ///
    /// Returns the original request and the outcome delivered to the
    /// submitter.
    pub fn complete(
        &self,
        key: PendingKey,
        ack: Ack,
    ) -> Result<(CommandRequest, CommandOutcome), Unmatched> {
        let entry = {
            let mut entries = self.lock();
            let Some(entry) = entries.get(&key) else {
                return Err(Unmatched::NotPending);
            };
            let expected = entry.request.code().ack_code();
            if !matches!(ack, Ack::Error(_)) && expected != Some(ack.code()) {
                return Err(Unmatched::WrongKind {
                    pending: entry.request.code(),
                });
            }
            entries.remove(&key).ok_or(Unmatched::NotPending)?
        };
        debug!(
            identity = %entry.identity,
            seq = key.sequence,
            attempt = entry.attempt,
            elapsed = ?entry.issued_at.elapsed(),
            "command acknowledged"
        );
        let request = entry.request.clone();
        let outcome = CommandOutcome::from(ack);
        entry.resolve(outcome.clone());
        Ok((request, outcome))
    }

    /// Count another attempt. Returns `None` if the entry is gone.
    pub fn retry(&self, key: PendingKey) -> Option<u32> {
        let mut entries = self.lock();
        let entry = entries.get_mut(&key)?;
        entry.attempt += 1;
        Some(entry.attempt)
    }

    /// Drop the entry without resolving it.
    ///
    /// Returns `false` if someone else already resolved it.
    pub fn abandon(&self, key: PendingKey) -> bool {
        self.lock().remove(&key).is_some()
    }

    /// Resolve every entry of `connection` as `DeviceOffline`.
    pub fn fail_connection(&self, connection: ConnectionId) -> usize {
        let failed: Vec<PendingCommand> = {
            let mut entries = self.lock();
            let keys: Vec<PendingKey> = entries
                .keys()
                .filter(|k| k.connection == connection)
                .copied()
                .collect();
            keys.iter().filter_map(|k| entries.remove(k)).collect()
        };
        let count = failed.len();
        for entry in failed {
            entry.resolve(CommandOutcome::DeviceOffline);
        }
        if count > 0 {
            debug!(%connection, count, "pending commands failed");
        }
        count
    }

    /// Resolve everything as `DeviceOffline`.
    pub fn fail_all(&self) -> usize {
        let failed: Vec<PendingCommand> = self.lock().drain().map(|(_, v)| v).collect();
        let count = failed.len();
        for entry in failed {
            entry.resolve(CommandOutcome::DeviceOffline);
        }
        count
    }

    pub fn contains(&self, key: PendingKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorReport, StartChargeAck, StopChargeAck};

    fn key(connection: ConnectionId, sequence: u16) -> PendingKey {
        PendingKey {
            connection,
            sequence,
        }
    }

    fn start(port: u8) -> CommandRequest {
        CommandRequest::StartCharge {
            port,
            correlation: "ORD-1".into(),
            limits: Default::default(),
        }
    }

    #[test]
    fn second_start_on_same_port_is_busy() {
        let table = PendingTable::new();
        let conn = ConnectionId::next();
        table.register(key(conn, 1), "PILE001", start(1)).unwrap();
        assert_eq!(
            table.register(key(conn, 2), "PILE001", start(1)).unwrap_err(),
            RejectReason::PortBusy(1)
        );
        table.register(key(conn, 3), "PILE001", start(2)).unwrap();
        table.register(key(conn, 4), "PILE002", start(1)).unwrap();
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn ack_resolves_once() {
        let table = PendingTable::new();
        let conn = ConnectionId::next();
        let mut rx = table.register(key(conn, 1), "PILE001", start(1)).unwrap();
        let ack = Ack::StartCharge(StartChargeAck { port: 1, result: 0 });

        let (request, outcome) = table.complete(key(conn, 1), ack.clone()).unwrap();
        assert_eq!(request, start(1));
        assert_eq!(outcome, CommandOutcome::Success(ack.clone()));
        assert_eq!(rx.try_recv().unwrap(), outcome);

        assert_eq!(
            table.complete(key(conn, 1), ack).unwrap_err(),
            Unmatched::NotPending
        );
        assert!(!table.abandon(key(conn, 1)));
    }

    #[test]
    fn wrong_ack_kind_leaves_entry() {
        let table = PendingTable::new();
        let conn = ConnectionId::next();
        table.register(key(conn, 1), "PILE001", start(1)).unwrap();
        let ack = Ack::StopCharge(StopChargeAck {
            port: 1,
            result: 0,
            energy_wh: None,
        });
        assert_eq!(
            table.complete(key(conn, 1), ack).unwrap_err(),
            Unmatched::WrongKind {
                pending: CommandCode::StartChargeRequest
            }
        );
        assert!(table.contains(key(conn, 1)));
    }

    #[test]
    fn device_error_rejects() {
        let table = PendingTable::new();
        let conn = ConnectionId::next();
        let mut rx = table.register(key(conn, 9), "PILE001", start(1)).unwrap();
        table
            .complete(key(conn, 9), Ack::Error(ErrorReport { reason: 5 }))
            .unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            CommandOutcome::Rejected(RejectReason::Device(5))
        );
    }

    #[test]
    fn fail_connection_only_touches_that_connection() {
        let table = PendingTable::new();
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        let mut ra = table.register(key(a, 1), "PILE001", start(1)).unwrap();
        let mut rb = table.register(key(b, 1), "PILE002", start(1)).unwrap();

        assert_eq!(table.fail_connection(a), 1);
        assert_eq!(ra.try_recv().unwrap(), CommandOutcome::DeviceOffline);
        assert!(rb.try_recv().is_err());
        assert_eq!(table.fail_connection(a), 0);

        assert_eq!(table.fail_all(), 1);
        assert_eq!(rb.try_recv().unwrap(), CommandOutcome::DeviceOffline);
        assert!(table.is_empty());
    }

    #[test]
    fn retry_counts_attempts() {
        let table = PendingTable::new();
        let conn = ConnectionId::next();
        table
            .register(key(conn, 1), "PILE001", CommandRequest::StopCharge { port: 1 })
            .unwrap();
        assert_eq!(table.retry(key(conn, 1)), Some(2));
        assert_eq!(table.retry(key(conn, 1)), Some(3));
        assert!(table.abandon(key(conn, 1)));
        assert_eq!(table.retry(key(conn, 1)), None);
    }
}
