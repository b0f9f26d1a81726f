//! Capability flags advertised in the Login payload.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

bitflags! {
    /// Raw capability bits carried by a Login packet.
    ///
    /// Unknown bits are preserved by `from_bits_retain` so a newer
    /// firmware's flags survive a decode/encode cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CapabilityFlags: u8 {
        /// Device speaks the extended payload layouts.
        const EXTENDED = 0x01;
        /// Heartbeats carry signal/temperature telemetry.
        const TELEMETRY = 0x02;
    }
}

/// Which payload layout family a device uses.
///
/// Selected once at Login and passed explicitly to every payload codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolCapability {
    #[default]
    Legacy,
    Extended,
}

impl From<CapabilityFlags> for ProtocolCapability {
    fn from(flags: CapabilityFlags) -> Self {
        if flags.contains(CapabilityFlags::EXTENDED) {
            ProtocolCapability::Extended
        } else {
            ProtocolCapability::Legacy
        }
    }
}

impl fmt::Display for ProtocolCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolCapability::Legacy => write!(f, "legacy"),
            ProtocolCapability::Extended => write!(f, "extended"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_from_flags() {
        assert_eq!(
            ProtocolCapability::from(CapabilityFlags::empty()),
            ProtocolCapability::Legacy
        );
        assert_eq!(
            ProtocolCapability::from(CapabilityFlags::EXTENDED | CapabilityFlags::TELEMETRY),
            ProtocolCapability::Extended
        );
        assert_eq!(
            ProtocolCapability::from(CapabilityFlags::TELEMETRY),
            ProtocolCapability::Legacy
        );
    }

    #[test]
    fn unknown_bits_retained() {
        let flags = CapabilityFlags::from_bits_retain(0x81);
        assert!(flags.contains(CapabilityFlags::EXTENDED));
        assert_eq!(flags.bits(), 0x81);
    }
}
