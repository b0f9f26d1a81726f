//! Status query payloads.
//!
//! ```text
//! Gateway ──[QueryStatusRequest]──► Device
//!   port u8          (0 = all ports)
//!
//! Device  ──[QueryStatusAck]──────► Gateway     (same sequence)
//!   count u8, count × port entry
//! ```

use bytes::BufMut;

use crate::error::GatewayError;
use crate::flags::ProtocolCapability;
use crate::protocol::{PayloadReader, PortReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStatus {
    /// `None` queries every port.
    pub port: Option<u8>,
}

impl QueryStatus {
    pub fn decode(r: &mut PayloadReader<'_>) -> Result<Self, GatewayError> {
        let port = r.u8("port")?;
        Ok(Self {
            port: (port != 0).then_some(port),
        })
    }

    pub fn encode(&self, dst: &mut impl BufMut) {
        dst.put_u8(self.port.unwrap_or(0));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryStatusAck {
    pub ports: Vec<PortReport>,
}

impl QueryStatusAck {
    pub fn decode(
        r: &mut PayloadReader<'_>,
        capability: ProtocolCapability,
    ) -> Result<Self, GatewayError> {
        let count = r.u8("count")? as usize;
        if r.remaining() < count * PortReport::encoded_len(capability) {
            return Err(r.malformed("port entries"));
        }
        let ports = (0..count)
            .map(|_| PortReport::decode(r, capability))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ports })
    }

    pub fn encode(&self, dst: &mut impl BufMut, capability: ProtocolCapability) {
        dst.put_u8(self.ports.len() as u8);
        for port in &self.ports {
            port.encode(dst, capability);
        }
    }
}
