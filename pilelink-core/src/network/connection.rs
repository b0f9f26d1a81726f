//! Per-socket connection handler.
//!
//! Each accepted socket gets one [`ConnectionHandler`]: a reader loop that
//! feeds decoded packets to the [`DeviceSession`], and a writer task that
//! drains the outbound queue the dispatcher fills through the session's
//! [`SessionHandle`]. Every exit path funnels through one close routine
//! that disables the ports, leaves the registry and raises events.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::PileCodec;
use crate::config::GatewayConfig;
use crate::dispatcher::{Ack, PendingKey, PendingTable, Unmatched};
use crate::error::FrameError;
use crate::events::EventSink;
use crate::packet::Packet;
use crate::protocol::{LoginAck, LoginResult, Message};
use crate::registry::{ActivityClock, CloseSignal, Registry, SessionHandle};
use crate::state::{CloseReason, ConnectionId, DeviceInfo, DeviceSession, DeviceSnapshot, SessionEffect};

type PacketSink<S> = SplitSink<Framed<S, PileCodec>, Packet>;
type PacketStream<S> = SplitStream<Framed<S, PileCodec>>;

/// Shared state every connection handler needs.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<Registry>,
    pub pending: Arc<PendingTable>,
    pub events: EventSink,
    /// Parent of every connection's close signal.
    pub shutdown: CancellationToken,
}

pub struct ConnectionHandler {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    ctx: ConnectionContext,
    session: DeviceSession,
    handle: Option<SessionHandle>,
    snapshot: Option<watch::Sender<DeviceSnapshot>>,
    outbound: mpsc::Sender<Packet>,
    close: Arc<CloseSignal>,
    activity: Arc<ActivityClock>,
    frame_errors: u32,
}

impl ConnectionHandler {
    /// Serve `stream` until it closes. Returns why it closed.
    pub async fn run<S>(stream: S, peer: Option<SocketAddr>, ctx: ConnectionContext) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnectionId::next();
        let close = Arc::new(CloseSignal::new(ctx.shutdown.child_token()));
        let (sink, stream) = Framed::new(stream, PileCodec::new(ctx.config.max_payload)).split();
        let (outbound, rx) = mpsc::channel(ctx.config.outbound_queue);

        let writer = tokio::spawn(write_loop(
            sink,
            rx,
            ctx.config.write_timeout,
            close.clone(),
        ));

        let mut handler = Self {
            id,
            peer,
            session: DeviceSession::new(id, ctx.config.max_protocol_violations),
            ctx,
            handle: None,
            snapshot: None,
            outbound,
            close,
            activity: Arc::new(ActivityClock::new()),
            frame_errors: 0,
        };
        debug!(conn = %id, peer = ?peer, "connection accepted");

        let reason = handler.read_loop(stream).await;
        let reason = handler.finish(reason);
        let _ = writer.await;
        reason
    }

    async fn read_loop<S>(&mut self, mut stream: PacketStream<S>) -> CloseReason
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let login_deadline = tokio::time::sleep(self.ctx.config.login_deadline);
        tokio::pin!(login_deadline);

        loop {
            let item = tokio::select! {
                biased;
                _ = self.close.closed() => {
                    return self.close.reason().unwrap_or(CloseReason::Shutdown);
                }
                _ = &mut login_deadline, if !self.session.phase().is_authenticated() => {
                    warn!(conn = %self.id, peer = ?self.peer, "no login before deadline");
                    return CloseReason::LoginTimeout;
                }
                item = stream.next() => item,
            };

            match item {
                None => return CloseReason::Disconnected,
                Some(Err(e)) => {
                    warn!(conn = %self.id, error = %e, "read failed");
                    return CloseReason::IoError;
                }
                Some(Ok(Err(error))) => {
                    if let Some(reason) = self.on_frame_error(error) {
                        return reason;
                    }
                }
                Some(Ok(Ok(packet))) => {
                    self.frame_errors = 0;
                    self.activity.touch();
                    if let Some(reason) = self.on_packet(packet).await {
                        return reason;
                    }
                }
            }
        }
    }

    fn on_frame_error(&mut self, error: FrameError) -> Option<CloseReason> {
        self.frame_errors += 1;
        warn!(
            conn = %self.id,
            identity = ?self.session.identity(),
            consecutive = self.frame_errors,
            %error,
            "frame error"
        );
        (self.frame_errors >= self.ctx.config.max_frame_errors).then_some(CloseReason::FrameErrors)
    }

    async fn on_packet(&mut self, packet: Packet) -> Option<CloseReason> {
        debug!(
            conn = %self.id,
            identity = ?self.session.identity(),
            command = %packet.command(),
            seq = packet.sequence(),
            "packet"
        );
        // Apply every effect: a failed admit still emits DeviceOnline.
        let mut close = None;
        for effect in self.session.on_packet(&packet) {
            match effect {
                SessionEffect::Authenticated(device) => {
                    if let Some(reason) = self.admit(device, packet.sequence()).await {
                        close.get_or_insert(reason);
                    }
                }
                SessionEffect::Event(event) => self.ctx.events.emit(event),
                SessionEffect::Ack(ack) => {
                    if let Some(reason) = self.resolve(packet.sequence(), ack) {
                        close.get_or_insert(reason);
                    }
                }
                SessionEffect::Close(reason) => {
                    close.get_or_insert(reason);
                }
            }
        }
        self.publish();
        close
    }

    /// Register the freshly authenticated session and answer the Login.
    async fn admit(&mut self, device: DeviceInfo, sequence: u16) -> Option<CloseReason> {
        let snapshot = self.session.snapshot()?;
        let (tx, rx) = watch::channel(snapshot);
        let handle = SessionHandle::new(
            self.id,
            device.clone(),
            self.outbound.clone(),
            self.close.clone(),
            rx,
            self.activity.clone(),
        );
        self.ctx.registry.install(handle.clone());
        self.handle = Some(handle);
        self.snapshot = Some(tx);

        let interval = self.ctx.config.heartbeat_interval.as_secs().min(u16::MAX as u64) as u16;
        let ack = Message::LoginAck(LoginAck {
            result: LoginResult::Accepted,
            heartbeat_interval_s: interval,
        });
        let packet = match ack.to_packet(sequence, device.capability) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(identity = %device.identity, error = %e, "cannot encode login ack");
                return Some(CloseReason::IoError);
            }
        };
        if self.outbound.send(packet).await.is_err() {
            return Some(CloseReason::IoError);
        }
        info!(
            identity = %device.identity,
            pile = %device.pile_number,
            conn = %self.id,
            peer = ?self.peer,
            "device online"
        );
        None
    }

    /// Match `ack` to its pending command. Acks nothing is waiting for
    /// never touch session state.
    fn resolve(&mut self, sequence: u16, ack: Ack) -> Option<CloseReason> {
        let code = ack.code();
        let key = PendingKey {
            connection: self.id,
            sequence,
        };
        match self.ctx.pending.complete(key, ack) {
            Ok((request, outcome)) => {
                let mut close = None;
                for effect in self.session.command_resolved(sequence, &request, &outcome) {
                    match effect {
                        SessionEffect::Event(event) => self.ctx.events.emit(event),
                        SessionEffect::Close(reason) => {
                            close.get_or_insert(reason);
                        }
                        SessionEffect::Authenticated(_) | SessionEffect::Ack(_) => {}
                    }
                }
                return close;
            }
            Err(Unmatched::NotPending) => {
                let issued = code
                    .request_code()
                    .map(|req| self.handle.as_ref().is_some_and(|h| h.was_issued(req)));
                match issued {
                    Some(true) => {
                        debug!(conn = %self.id, seq = sequence, %code, "stale ack discarded");
                    }
                    Some(false) => {
                        self.session.record_anomaly();
                        warn!(
                            identity = ?self.session.identity(),
                            seq = sequence,
                            %code,
                            "ack for a command never issued"
                        );
                    }
                    None => {
                        warn!(identity = ?self.session.identity(), seq = sequence, "device error report");
                    }
                }
            }
            Err(Unmatched::WrongKind { pending }) => {
                self.session.record_anomaly();
                warn!(
                    identity = ?self.session.identity(),
                    seq = sequence,
                    %code,
                    %pending,
                    "ack does not match pending command"
                );
            }
        }
        None
    }

    fn publish(&self) {
        if let (Some(tx), Some(snapshot)) = (&self.snapshot, self.session.snapshot()) {
            tx.send_replace(snapshot);
        }
    }

    /// The single close path for every exit reason. The first recorded
    /// reason wins over whatever the read loop observed.
    fn finish(&mut self, reason: CloseReason) -> CloseReason {
        self.close.close(reason);
        let reason = self.close.reason().unwrap_or(reason);
        let events = self.session.close(reason);
        self.publish();
        match &self.handle {
            Some(handle) => {
                self.ctx.registry.remove(handle.identity(), self.id);
            }
            None => {
                self.ctx.pending.fail_connection(self.id);
            }
        }
        for event in events {
            self.ctx.events.emit(event);
        }
        info!(
            conn = %self.id,
            identity = ?self.session.identity(),
            peer = ?self.peer,
            %reason,
            "connection closed"
        );
        reason
    }
}

async fn write_loop<S>(
    mut sink: PacketSink<S>,
    mut rx: mpsc::Receiver<Packet>,
    write_timeout: Duration,
    close: Arc<CloseSignal>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            biased;
            _ = close.closed() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        match tokio::time::timeout(write_timeout, sink.send(packet)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "write failed");
                close.close(CloseReason::IoError);
                break;
            }
            Err(_) => {
                warn!(timeout = ?write_timeout, "write timed out");
                close.close(CloseReason::WriteTimeout);
                break;
            }
        }
    }
    let _ = tokio::time::timeout(write_timeout, sink.close()).await;
}
