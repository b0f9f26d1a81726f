mod port;
mod session;

pub use port::PortState;
pub use session::{
    CloseReason, ConnectionId, DeviceInfo, DeviceSession, DeviceSnapshot, SessionEffect,
    SessionPhase,
};
