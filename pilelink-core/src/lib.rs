//! # pilelink-core
//!
//! Protocol and session core of the pilelink charging-pile gateway.
//!
//! This crate contains:
//! - **Codec**: `PileCodec` and the pure `decode`/`encode` frame functions
//! - **Protocol payloads**: typed layouts per command, legacy and extended
//! - **State**: the per-device `DeviceSession` state machine and `PortState`
//! - **Registry**: identity → `SessionHandle` map with atomic replacement
//! - **Dispatcher**: start/stop/query commands with retries and timeouts
//! - **Supervisor**: heartbeat-timeout eviction
//! - **Network**: the per-socket `ConnectionHandler`
//! - **Events**: `DomainEvent`s and the `OrderService` boundary
//! - **Gateway**: the facade tying it all together
//! - **Error**: `GatewayError`, `FrameError`, `CommandError`

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod flags;
pub mod gateway;
pub mod header;
pub mod message;
pub mod network;
pub mod packet;
pub mod protocol;
pub mod registry;
pub mod state;
pub mod supervisor;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{Decoded, PileCodec};
pub use config::GatewayConfig;
pub use dispatcher::{Ack, CommandOutcome, CommandRequest, Dispatcher, RejectReason, RetryPolicy};
pub use error::{CommandError, FrameError, GatewayError};
pub use events::{DomainEvent, EventSink, LogOrderService, OrderService};
pub use flags::{CapabilityFlags, ProtocolCapability};
pub use gateway::{DeviceStatus, Gateway};
pub use header::{FRAME_MARKER, HEADER_SIZE};
pub use message::CommandCode;
pub use packet::{MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE, Packet};
pub use registry::{Registry, SessionHandle};
pub use state::{CloseReason, ConnectionId, DeviceSession, DeviceSnapshot, PortState, SessionPhase};
