//! Process-wide device registry.
//!
//! Maps device identity to the [`SessionHandle`] of its one live
//! connection. The registry never owns a session: handles carry the
//! channels, cancellation token and snapshot receiver that let other
//! components talk to the connection handler that does.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info};

use crate::dispatcher::PendingTable;
use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::message::CommandCode;
use crate::packet::Packet;
use crate::state::{CloseReason, ConnectionId, DeviceInfo, DeviceSnapshot};

// ── ActivityClock ────────────────────────────────────────────────

/// Last-activity timestamp shared between a handler and the supervisor.
#[derive(Debug)]
pub struct ActivityClock {
    epoch: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

// ── CloseSignal ──────────────────────────────────────────────────

/// One-shot close request shared by a connection's handler, writer and
/// registry handle. The first reason recorded wins.
#[derive(Debug)]
pub struct CloseSignal {
    token: CancellationToken,
    reason: OnceLock<CloseReason>,
}

impl CloseSignal {
    /// `token` is usually a child of the gateway's shutdown token.
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            reason: OnceLock::new(),
        }
    }

    /// Returns `false` if a reason was already recorded.
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// Recorded reason; `Shutdown` if only the parent token fired.
    pub fn reason(&self) -> Option<CloseReason> {
        match self.reason.get() {
            Some(reason) => Some(*reason),
            None if self.token.is_cancelled() => Some(CloseReason::Shutdown),
            None => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }
}

// ── SessionHandle ────────────────────────────────────────────────

/// Cloneable reference to a live connection.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    connection: ConnectionId,
    device: DeviceInfo,
    outbound: mpsc::Sender<Packet>,
    close: Arc<CloseSignal>,
    snapshot: watch::Receiver<DeviceSnapshot>,
    sequence: AtomicU16,
    issued: AtomicU8,
    activity: Arc<ActivityClock>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("connection", &self.inner.connection)
            .field("identity", &self.inner.device.identity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    pub fn new(
        connection: ConnectionId,
        device: DeviceInfo,
        outbound: mpsc::Sender<Packet>,
        close: Arc<CloseSignal>,
        snapshot: watch::Receiver<DeviceSnapshot>,
        activity: Arc<ActivityClock>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                connection,
                device,
                outbound,
                close,
                snapshot,
                sequence: AtomicU16::new(0),
                issued: AtomicU8::new(0),
                activity,
            }),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.inner.connection
    }

    pub fn identity(&self) -> &str {
        &self.inner.device.identity
    }

    pub fn pile_number(&self) -> &str {
        &self.inner.device.pile_number
    }

    pub fn capability(&self) -> ProtocolCapability {
        self.inner.device.capability
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Next gateway-issued sequence number: starts at 1, skips 0 on wrap.
    pub fn next_sequence(&self) -> u16 {
        let step = |s: u16| if s == u16::MAX { 1 } else { s + 1 };
        let prev = self
            .inner
            .sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |s| Some(step(s)))
            .unwrap_or_else(|s| s);
        step(prev)
    }

    /// Remember that a request of this kind went out on the connection.
    pub fn mark_issued(&self, request: CommandCode) {
        if let Some(bit) = issued_bit(request) {
            self.inner.issued.fetch_or(bit, Ordering::Relaxed);
        }
    }

    pub fn was_issued(&self, request: CommandCode) -> bool {
        issued_bit(request)
            .is_some_and(|bit| self.inner.issued.load(Ordering::Relaxed) & bit != 0)
    }

    pub fn idle_for(&self) -> Duration {
        self.inner.activity.idle_for()
    }

    /// Queue a packet for the connection's writer.
    pub async fn send(&self, packet: Packet) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::ChannelClosed);
        }
        self.inner.outbound.send(packet).await?;
        Ok(())
    }

    /// Ask the owning handler to close. The first reason wins.
    ///
    /// Returns `false` if the handle was already closing.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.inner.close.close(reason)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close.reason()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close.is_closed()
    }

    /// Resolves once the connection has been told to close.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.inner.close.closed()
    }
}

fn issued_bit(code: CommandCode) -> Option<u8> {
    match code {
        CommandCode::StartChargeRequest => Some(0x01),
        CommandCode::StopChargeRequest => Some(0x02),
        CommandCode::QueryStatusRequest => Some(0x04),
        _ => None,
    }
}

// ── Registry ─────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, SessionHandle>,
    /// pile number -> identity
    piles: HashMap<String, String>,
}

/// Identity → live session map.
///
/// All membership changes go through [`install`](Self::install) and
/// [`remove`](Self::remove); both resolve the affected connection's
/// pending commands before returning.
pub struct Registry {
    inner: Mutex<Inner>,
    pending: Arc<PendingTable>,
}

impl Registry {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            pending,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `handle` the live session for its identity.
    ///
    /// A prior session for the same identity is closed with
    /// [`CloseReason::DuplicateLogin`] and its pending commands fail
    /// before the new handle becomes visible.
    pub fn install(&self, handle: SessionHandle) -> Option<SessionHandle> {
        let identity = handle.identity().to_owned();
        let pile = handle.pile_number().to_owned();
        let mut inner = self.lock();

        let prior = inner.sessions.remove(&identity);
        if let Some(prior) = &prior {
            prior.close(CloseReason::DuplicateLogin);
            let failed = self.pending.fail_connection(prior.connection());
            if inner.piles.get(prior.pile_number()) == Some(&identity) {
                inner.piles.remove(prior.pile_number());
            }
            info!(
                %identity,
                old = %prior.connection(),
                new = %handle.connection(),
                failed,
                "session superseded"
            );
        }

        inner.piles.insert(pile, identity.clone());
        inner.sessions.insert(identity, handle);
        prior
    }

    /// Remove `identity` if it still belongs to `connection`.
    ///
    /// Pending commands of `connection` fail either way.
    pub fn remove(&self, identity: &str, connection: ConnectionId) -> bool {
        let mut inner = self.lock();
        let owned = inner
            .sessions
            .get(identity)
            .is_some_and(|h| h.connection() == connection);
        if owned {
            if let Some(handle) = inner.sessions.remove(identity) {
                if inner.piles.get(handle.pile_number()).map(String::as_str) == Some(identity) {
                    inner.piles.remove(handle.pile_number());
                }
            }
            debug!(identity, %connection, "session removed");
        }
        self.pending.fail_connection(connection);
        owned
    }

    pub fn lookup(&self, identity: &str) -> Option<SessionHandle> {
        self.lock().sessions.get(identity).cloned()
    }

    pub fn lookup_pile(&self, pile_number: &str) -> Option<SessionHandle> {
        let inner = self.lock();
        inner
            .piles
            .get(pile_number)
            .and_then(|identity| inner.sessions.get(identity))
            .cloned()
    }

    pub fn snapshot(&self, identity: &str) -> Option<DeviceSnapshot> {
        self.lookup(identity).map(|h| h.snapshot())
    }

    /// Snapshots of every live session, ordered by identity.
    pub fn snapshots(&self) -> Vec<DeviceSnapshot> {
        let mut all: Vec<_> = self.handles().iter().map(SessionHandle::snapshot).collect();
        all.sort_by(|a, b| a.device.identity.cmp(&b.device.identity));
        all
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.lock().sessions.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every live session to close. Returns how many were told.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        self.handles()
            .iter()
            .filter(|h| h.close(reason))
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatcher::{CommandOutcome, CommandRequest, PendingKey};
    use crate::flags::CapabilityFlags;
    use crate::protocol::FirmwareVersion;
    use crate::state::SessionPhase;

    pub(crate) struct TestHandle {
        pub handle: SessionHandle,
        pub outbound: mpsc::Receiver<Packet>,
        pub snapshot: watch::Sender<DeviceSnapshot>,
    }

    pub(crate) fn device(identity: &str, pile: &str, ports: u8) -> DeviceInfo {
        DeviceInfo {
            identity: identity.into(),
            pile_number: pile.into(),
            capability: ProtocolCapability::Legacy,
            flags: CapabilityFlags::empty(),
            firmware: FirmwareVersion { major: 1, minor: 0 },
            port_count: ports,
        }
    }

    pub(crate) fn test_handle(identity: &str, pile: &str) -> TestHandle {
        let connection = ConnectionId::next();
        let device = device(identity, pile, 2);
        let (tx, rx) = mpsc::channel(8);
        let (snap_tx, snap_rx) = watch::channel(DeviceSnapshot {
            connection,
            device: device.clone(),
            phase: SessionPhase::Authenticated,
            ports: (1..=2).map(crate::state::PortState::new).collect(),
            telemetry: None,
            anomalies: 0,
        });
        TestHandle {
            handle: SessionHandle::new(
                connection,
                device,
                tx,
                Arc::new(CloseSignal::new(CancellationToken::new())),
                snap_rx,
                Arc::new(ActivityClock::new()),
            ),
            outbound: rx,
            snapshot: snap_tx,
        }
    }

    fn registry() -> (Registry, Arc<PendingTable>) {
        let pending = Arc::new(PendingTable::new());
        (Registry::new(pending.clone()), pending)
    }

    #[test]
    fn sequence_starts_at_one_and_skips_zero() {
        let t = test_handle("PILE001", "P-1");
        assert_eq!(t.handle.next_sequence(), 1);
        assert_eq!(t.handle.next_sequence(), 2);
        t.handle.inner.sequence.store(u16::MAX - 1, Ordering::Relaxed);
        assert_eq!(t.handle.next_sequence(), u16::MAX);
        assert_eq!(t.handle.next_sequence(), 1);
    }

    #[test]
    fn issued_kinds_are_tracked() {
        let t = test_handle("PILE001", "P-1");
        assert!(!t.handle.was_issued(CommandCode::StopChargeRequest));
        t.handle.mark_issued(CommandCode::StopChargeRequest);
        assert!(t.handle.was_issued(CommandCode::StopChargeRequest));
        assert!(!t.handle.was_issued(CommandCode::StartChargeRequest));
    }

    #[test]
    fn parent_cancel_reads_as_shutdown() {
        let parent = CancellationToken::new();
        let signal = CloseSignal::new(parent.child_token());
        assert_eq!(signal.reason(), None);
        parent.cancel();
        assert!(signal.is_closed());
        assert_eq!(signal.reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn first_close_reason_wins() {
        let t = test_handle("PILE001", "P-1");
        assert!(t.handle.close(CloseReason::HeartbeatTimeout));
        assert!(!t.handle.close(CloseReason::Shutdown));
        assert_eq!(t.handle.close_reason(), Some(CloseReason::HeartbeatTimeout));
        assert!(t.handle.is_closed());
    }

    #[test]
    fn install_evicts_prior_and_fails_its_pending() {
        let (reg, pending) = registry();
        let old = test_handle("PILE001", "P-1");
        assert!(reg.install(old.handle.clone()).is_none());

        let key = PendingKey {
            connection: old.handle.connection(),
            sequence: 1,
        };
        let mut rx = pending
            .register(key, "PILE001", CommandRequest::StopCharge { port: 1 })
            .unwrap();

        let new = test_handle("PILE001", "P-1");
        let evicted = reg.install(new.handle.clone()).unwrap();
        assert_eq!(evicted.connection(), old.handle.connection());
        assert_eq!(old.handle.close_reason(), Some(CloseReason::DuplicateLogin));
        assert_eq!(rx.try_recv().unwrap(), CommandOutcome::DeviceOffline);
        assert_eq!(
            reg.lookup("PILE001").unwrap().connection(),
            new.handle.connection()
        );
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn stale_remove_keeps_fresh_session() {
        let (reg, _) = registry();
        let old = test_handle("PILE001", "P-1");
        let new = test_handle("PILE001", "P-1");
        reg.install(old.handle.clone());
        reg.install(new.handle.clone());

        assert!(!reg.remove("PILE001", old.handle.connection()));
        assert!(reg.lookup_pile("P-1").is_some());
        assert!(reg.remove("PILE001", new.handle.connection()));
        assert!(reg.lookup("PILE001").is_none());
        assert!(reg.lookup_pile("P-1").is_none());
    }

    #[test]
    fn pile_index_follows_identity() {
        let (reg, _) = registry();
        let a = test_handle("PILE001", "P-1");
        let b = test_handle("PILE002", "P-2");
        reg.install(a.handle.clone());
        reg.install(b.handle.clone());
        assert_eq!(reg.lookup_pile("P-2").unwrap().identity(), "PILE002");
        let ids: Vec<_> = reg
            .snapshots()
            .into_iter()
            .map(|s| s.device.identity)
            .collect();
        assert_eq!(ids, vec!["PILE001", "PILE002"]);
    }

    #[test]
    fn concurrent_installs_leave_one_session() {
        let (reg, _) = registry();
        let reg = Arc::new(reg);
        let handles: Vec<_> = (0..16).map(|_| test_handle("PILE001", "P-1")).collect();
        std::thread::scope(|scope| {
            for t in &handles {
                let reg = reg.clone();
                let h = t.handle.clone();
                scope.spawn(move || {
                    reg.install(h);
                });
            }
        });
        assert_eq!(reg.len(), 1);
        let live = reg.lookup("PILE001").unwrap();
        let open: Vec<_> = handles.iter().filter(|t| !t.handle.is_closed()).collect();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].handle.connection(), live.connection());
    }

    #[tokio::test]
    async fn send_fails_after_close() {
        let mut t = test_handle("PILE001", "P-1");
        let pkt = Packet::new(CommandCode::QueryStatusRequest, 1, vec![0]).unwrap();
        t.handle.send(pkt.clone()).await.unwrap();
        assert_eq!(t.outbound.recv().await.unwrap(), pkt);
        t.handle.close(CloseReason::Shutdown);
        assert!(t.handle.send(pkt).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn activity_clock_tracks_idle_time() {
        let clock = ActivityClock::new();
        clock.touch();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(clock.idle_for() >= Duration::from_secs(5));
        clock.touch();
        assert!(clock.idle_for() < Duration::from_secs(1));
    }

    #[test]
    fn snapshot_reflects_published_state() {
        let (reg, _) = registry();
        let t = test_handle("PILE001", "P-1");
        reg.install(t.handle.clone());
        t.snapshot.send_modify(|s| s.phase = SessionPhase::Active);
        assert_eq!(reg.snapshot("PILE001").unwrap().phase, SessionPhase::Active);
    }
}
