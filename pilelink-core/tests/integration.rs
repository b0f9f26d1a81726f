//! Integration tests: full device lifecycle, command round-trips and
//! failure scenarios over real TCP connections on localhost.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use pilelink_core::dispatcher::{Ack, CommandOutcome, RejectReason, RetryPolicy};
use pilelink_core::protocol::{
    FirmwareVersion, Login, LoginAck, LoginResult, Message, PortMetrics, PortReport, PortStatus,
    StartCharge, StartChargeAck,
};
use pilelink_core::{
    CapabilityFlags, CloseReason, CommandCode, DeviceStatus, DomainEvent, Gateway, GatewayConfig,
    GatewayError, OrderService, Packet, PileCodec, ProtocolCapability, SessionPhase,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Order service that remembers every event.
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<DomainEvent>>,
    active: Mutex<Option<String>>,
}

impl Recorder {
    fn events(&self) -> Vec<DomainEvent> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, kind: &str) -> usize {
        self.events().iter().filter(|e| e.kind() == kind).count()
    }

    async fn wait_for(&self, kind: &str, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.count(kind) < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {n} {kind} events"));
    }
}

#[async_trait]
impl OrderService for Recorder {
    async fn active_order(&self, _: &str, _: u8) -> Result<Option<String>, GatewayError> {
        Ok(self.active.lock().unwrap().clone())
    }

    async fn record(&self, event: &DomainEvent) -> Result<(), GatewayError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

fn fast_config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        login_deadline: Duration::from_secs(2),
        heartbeat_timeout: Duration::from_secs(30),
        supervisor_tick: Duration::from_millis(50),
        retry: RetryPolicy {
            max_retries: 2,
            attempt_timeout: Duration::from_millis(150),
            backoff: Duration::from_millis(20),
        },
        ..Default::default()
    }
}

/// Start a gateway on an ephemeral port.
async fn start(config: GatewayConfig) -> (Arc<Gateway>, Arc<Recorder>, std::net::SocketAddr) {
    let recorder = Arc::new(Recorder::default());
    let gateway = Arc::new(Gateway::new(config, recorder.clone()).unwrap());
    let listener = gateway.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn({
        let gateway = gateway.clone();
        async move { gateway.run(listener).await }
    });
    (gateway, recorder, addr)
}

/// A fake charging pile speaking the wire protocol.
struct Device {
    io: Framed<TcpStream, PileCodec>,
    capability: ProtocolCapability,
    seq: u16,
}

impl Device {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        Self {
            io: Framed::new(TcpStream::connect(addr).await.unwrap(), PileCodec::default()),
            capability: ProtocolCapability::Legacy,
            seq: 0,
        }
    }

    async fn send(&mut self, msg: Message) {
        self.seq = self.seq.wrapping_add(1);
        let pkt = msg.to_packet(self.seq, self.capability).unwrap();
        self.io.send(pkt).await.unwrap();
    }

    async fn reply(&mut self, sequence: u16, msg: Message) {
        let pkt = msg.to_packet(sequence, self.capability).unwrap();
        self.io.send(pkt).await.unwrap();
    }

    /// Next packet, or `None` if the gateway closed the socket.
    async fn recv(&mut self) -> Option<Packet> {
        let item = tokio::time::timeout(Duration::from_secs(5), self.io.next())
            .await
            .expect("gateway did not answer");
        match item {
            Some(Ok(Ok(pkt))) => Some(pkt),
            Some(Ok(Err(e))) => panic!("frame error from gateway: {e}"),
            Some(Err(_)) | None => None,
        }
    }

    async fn login(&mut self, identity: &str, pile: &str, ports: u8) -> LoginAck {
        self.send(Message::Login(Login {
            identity: identity.into(),
            pile_number: pile.into(),
            flags: match self.capability {
                ProtocolCapability::Legacy => CapabilityFlags::empty(),
                ProtocolCapability::Extended => CapabilityFlags::EXTENDED,
            },
            port_count: ports,
            firmware: FirmwareVersion { major: 4, minor: 2 },
        }))
        .await;
        let pkt = self.recv().await.expect("no login ack");
        assert_eq!(pkt.command(), CommandCode::LoginAck);
        assert_eq!(pkt.sequence(), self.seq);
        match Message::decode(&pkt, self.capability).unwrap() {
            Message::LoginAck(ack) => ack,
            other => panic!("unexpected {other:?}"),
        }
    }

    async fn heartbeat(&mut self) {
        self.send(Message::Heartbeat(Default::default())).await;
    }

    async fn report(&mut self, port: u8, status: PortStatus) {
        self.send(Message::PortStatusReport(PortReport {
            port,
            status,
            metrics: PortMetrics {
                voltage_dv: 2300,
                current_ca: 1600,
                energy_wh: 42,
                ..Default::default()
            },
        }))
        .await;
    }
}

/// Poll until `f` holds or panic after a few seconds.
async fn eventually(mut f: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !f() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never held");
}

fn port_status(gw: &Gateway, pile: &str, port: u8) -> Option<PortStatus> {
    match gw.query_device_status(pile) {
        DeviceStatus::Online(snap) => snap.port(port).map(|p| p.status),
        DeviceStatus::Offline => None,
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn test_start_charge_happy_path() {
    let (gw, recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;

    let ack = dev.login("PILE001", "P-0001", 2).await;
    assert_eq!(ack.result, LoginResult::Accepted);
    assert_eq!(ack.heartbeat_interval_s, 30);
    match gw.query_device_status("P-0001") {
        DeviceStatus::Online(snap) => {
            assert_eq!(snap.phase, SessionPhase::Authenticated);
            assert_eq!(snap.ports.len(), 2);
        }
        DeviceStatus::Offline => panic!("device should be online"),
    }

    dev.heartbeat().await;
    eventually(|| {
        matches!(gw.query_device_status("P-0001"),
            DeviceStatus::Online(s) if s.phase == SessionPhase::Active)
    })
    .await;

    let command = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_start_charge("P-0001", 1, "ORD-1001").await }
    });

    let req = dev.recv().await.unwrap();
    assert_eq!(req.command(), CommandCode::StartChargeRequest);
    assert_eq!(req.sequence(), 1);
    match Message::decode(&req, ProtocolCapability::Legacy).unwrap() {
        Message::StartChargeRequest(StartCharge {
            port, correlation, ..
        }) => {
            assert_eq!(port, 1);
            assert_eq!(correlation, "ORD-1001");
        }
        other => panic!("unexpected {other:?}"),
    }

    dev.reply(1, Message::StartChargeAck(StartChargeAck { port: 1, result: 0 }))
        .await;
    let outcome = command.await.unwrap();
    assert_eq!(
        outcome,
        CommandOutcome::Success(Ack::StartCharge(StartChargeAck { port: 1, result: 0 }))
    );

    dev.report(1, PortStatus::Charging).await;
    eventually(|| port_status(&gw, "P-0001", 1) == Some(PortStatus::Charging)).await;
    recorder.wait_for("port_status_changed", 1).await;

    let changed = recorder
        .events()
        .into_iter()
        .find_map(|e| match e {
            DomainEvent::PortStatusChanged {
                port,
                status,
                correlation,
                ..
            } => Some((port, status, correlation)),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        changed,
        (1, PortStatus::Charging, Some("ORD-1001".to_string()))
    );
    assert_eq!(recorder.count("device_online"), 1);
}

#[tokio::test]
async fn test_heartbeat_timeout_interrupts_charging_port() {
    let config = GatewayConfig {
        heartbeat_timeout: Duration::from_millis(300),
        ..fast_config()
    };
    let (gw, recorder, addr) = start(config).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;
    dev.report(1, PortStatus::Charging).await;
    eventually(|| port_status(&gw, "P-0001", 1) == Some(PortStatus::Charging)).await;

    // Go silent.
    assert!(dev.recv().await.is_none(), "gateway should drop the socket");
    recorder.wait_for("device_offline", 1).await;

    assert_eq!(recorder.count("charge_interrupted"), 1);
    let reason = recorder.events().into_iter().find_map(|e| match e {
        DomainEvent::ChargeInterrupted { port, reason, .. } => Some((port, reason)),
        _ => None,
    });
    assert_eq!(reason, Some((1, CloseReason::HeartbeatTimeout)));
    assert_eq!(gw.query_device_status("P-0001"), DeviceStatus::Offline);
}

#[tokio::test]
async fn test_unacknowledged_command_times_out() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;

    let command = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_stop_charge("P-0001", 1).await }
    });

    // Same sequence on every attempt.
    for _ in 0..3 {
        let pkt = dev.recv().await.unwrap();
        assert_eq!(pkt.command(), CommandCode::StopChargeRequest);
        assert_eq!(pkt.sequence(), 1);
    }
    assert_eq!(
        command.await.unwrap(),
        CommandOutcome::Timeout { attempts: 3 }
    );
}

#[tokio::test]
async fn test_offline_device_returns_immediately() {
    let (gw, _recorder, _addr) = start(fast_config()).await;
    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        gw.request_start_charge("P-9999", 1, "ORD-1"),
    )
    .await
    .unwrap();
    assert_eq!(outcome, CommandOutcome::DeviceOffline);
}

#[tokio::test]
async fn test_second_start_on_same_port_rejected() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 2).await;

    let first = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_start_charge("P-0001", 1, "ORD-A").await }
    });
    let req = dev.recv().await.unwrap();
    assert_eq!(req.command(), CommandCode::StartChargeRequest);

    let second = gw.request_start_charge("P-0001", 1, "ORD-B").await;
    assert_eq!(second, CommandOutcome::Rejected(RejectReason::PortBusy(1)));

    dev.reply(
        req.sequence(),
        Message::StartChargeAck(StartChargeAck { port: 1, result: 0 }),
    )
    .await;
    assert!(first.await.unwrap().is_success());
}

#[tokio::test]
async fn test_order_conflict_rejected() {
    let (gw, recorder, addr) = start(fast_config()).await;
    *recorder.active.lock().unwrap() = Some("ORD-EXISTING".into());
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;

    let outcome = gw.request_start_charge("P-0001", 1, "ORD-NEW").await;
    assert_eq!(
        outcome,
        CommandOutcome::Rejected(RejectReason::OrderConflict {
            active: "ORD-EXISTING".into()
        })
    );
}

#[tokio::test]
async fn test_device_rejection_code() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;

    let command = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_start_charge("P-0001", 1, "ORD-1").await }
    });
    let req = dev.recv().await.unwrap();
    dev.reply(
        req.sequence(),
        Message::StartChargeAck(StartChargeAck { port: 1, result: 4 }),
    )
    .await;
    assert_eq!(
        command.await.unwrap(),
        CommandOutcome::Rejected(RejectReason::Device(4))
    );
}

#[tokio::test]
async fn test_duplicate_login_supersedes_old_session() {
    let (gw, recorder, addr) = start(fast_config()).await;
    let mut old = Device::connect(addr).await;
    old.login("PILE001", "P-0001", 1).await;
    old.report(1, PortStatus::Charging).await;
    eventually(|| port_status(&gw, "P-0001", 1) == Some(PortStatus::Charging)).await;

    let mut new = Device::connect(addr).await;
    new.login("PILE001", "P-0001", 1).await;

    assert!(old.recv().await.is_none(), "old socket should be closed");
    recorder.wait_for("device_offline", 1).await;
    assert_eq!(recorder.count("charge_interrupted"), 1);
    assert!(recorder.events().iter().any(|e| matches!(
        e,
        DomainEvent::DeviceOffline {
            reason: CloseReason::DuplicateLogin,
            ..
        }
    )));

    // The new session is the live one and starts fresh.
    assert_eq!(port_status(&gw, "P-0001", 1), Some(PortStatus::Idle));
    assert_eq!(gw.online_devices().len(), 1);
}

#[tokio::test]
async fn test_concurrent_logins_leave_one_session() {
    let (gw, recorder, addr) = start(fast_config()).await;
    let mut devices = Vec::new();
    for _ in 0..8 {
        devices.push(Device::connect(addr).await);
    }
    let logins = devices.iter_mut().map(|dev| {
        dev.send(Message::Login(Login {
            identity: "PILE001".into(),
            pile_number: "P-0001".into(),
            flags: CapabilityFlags::empty(),
            port_count: 1,
            firmware: FirmwareVersion { major: 4, minor: 2 },
        }))
    });
    futures::future::join_all(logins).await;

    // Every superseded session goes offline exactly once.
    recorder.wait_for("device_online", 8).await;
    recorder.wait_for("device_offline", 7).await;
    assert_eq!(gw.registry().len(), 1);
    assert_eq!(gw.online_devices().len(), 1);
    assert!(recorder.events().iter().all(|e| match e {
        DomainEvent::DeviceOffline { reason, .. } => *reason == CloseReason::DuplicateLogin,
        _ => true,
    }));
}

#[tokio::test]
async fn test_garbage_before_login_is_skipped() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    {
        use tokio::io::AsyncWriteExt;
        dev.io.get_mut().write_all(&[0x00, 0x13, 0x37]).await.unwrap();
    }
    dev.login("PILE001", "P-0001", 1).await;
    assert!(matches!(
        gw.query_device_status("P-0001"),
        DeviceStatus::Online(_)
    ));
}

#[tokio::test]
async fn test_repeated_login_on_same_socket_closes() {
    let (gw, recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;
    dev.send(Message::Login(Login {
        identity: "PILE001".into(),
        pile_number: "P-0001".into(),
        flags: CapabilityFlags::empty(),
        port_count: 1,
        firmware: FirmwareVersion { major: 4, minor: 2 },
    }))
    .await;
    assert!(dev.recv().await.is_none());
    recorder.wait_for("device_offline", 1).await;
    assert_eq!(gw.query_device_status("P-0001"), DeviceStatus::Offline);
}

#[tokio::test]
async fn test_extended_device_status_refresh() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.capability = ProtocolCapability::Extended;
    dev.login("PILE002", "P-0002", 2).await;

    let command = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_status_refresh("P-0002", None).await }
    });
    let req = dev.recv().await.unwrap();
    assert_eq!(req.command(), CommandCode::QueryStatusRequest);
    assert_eq!(req.payload().as_ref(), &[0]);

    let reports = (1..=2)
        .map(|port| PortReport {
            port,
            status: PortStatus::Fault,
            metrics: PortMetrics {
                power_w: Some(0),
                device_timestamp: Some(1_700_000_000),
                ..Default::default()
            },
        })
        .collect();
    dev.reply(
        req.sequence(),
        Message::QueryStatusAck(pilelink_core::protocol::QueryStatusAck { ports: reports }),
    )
    .await;

    assert!(command.await.unwrap().is_success());
    eventually(|| port_status(&gw, "P-0002", 2) == Some(PortStatus::Fault)).await;
    match gw.query_device_status("P-0002") {
        DeviceStatus::Online(snap) => {
            assert!(snap.ports.iter().all(|p| p.status == PortStatus::Fault));
            assert_eq!(snap.phase, SessionPhase::Active);
            assert_eq!(
                snap.ports[0].metrics.and_then(|m| m.device_timestamp),
                Some(1_700_000_000)
            );
        }
        DeviceStatus::Offline => panic!("device should be online"),
    }
}

#[tokio::test]
async fn test_shutdown_fails_pending_and_closes_sockets() {
    let (gw, _recorder, addr) = start(fast_config()).await;
    let mut dev = Device::connect(addr).await;
    dev.login("PILE001", "P-0001", 1).await;

    let command = tokio::spawn({
        let gw = gw.clone();
        async move { gw.request_stop_charge("P-0001", 1).await }
    });
    dev.recv().await.unwrap();
    gw.shutdown();

    let outcome = command.await.unwrap();
    assert!(matches!(
        outcome,
        CommandOutcome::DeviceOffline | CommandOutcome::Cancelled
    ));
    assert!(dev.recv().await.is_none());
}
