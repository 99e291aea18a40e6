//! The 8-byte protocol header exchanged before any frame

use bytes::Bytes;
use ferrox_amqp_types::definitions::{MAJOR, MINOR, REVISION};

const PROTOCOL_HEADER_PREFIX: &[u8; 4] = b"AMQP";

/// Protocol header, `"AMQP" id major minor revision`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolHeader {
    /// Protocol layer the header introduces
    pub id: ProtocolId,
    /// Major version
    pub major: u8,
    /// Minor version
    pub minor: u8,
    /// Revision
    pub revision: u8,
}

impl Default for ProtocolHeader {
    fn default() -> Self {
        Self::amqp()
    }
}

impl ProtocolHeader {
    /// Creates a new protocol header
    pub fn new(id: ProtocolId, major: u8, minor: u8, revision: u8) -> Self {
        Self {
            id,
            major,
            minor,
            revision,
        }
    }

    /// `AMQP 0 1 0 0`
    pub fn amqp() -> Self {
        Self::new(ProtocolId::Amqp, MAJOR, MINOR, REVISION)
    }

    /// `AMQP 3 1 0 0`, which introduces the SASL layer
    pub fn sasl() -> Self {
        Self::new(ProtocolId::Sasl, MAJOR, MINOR, REVISION)
    }

    /// Whether the header introduces the AMQP layer
    pub fn is_amqp(&self) -> bool {
        matches!(self.id, ProtocolId::Amqp)
    }

    /// Whether the header introduces the SASL layer
    pub fn is_sasl(&self) -> bool {
        matches!(self.id, ProtocolId::Sasl)
    }
}

impl From<ProtocolHeader> for [u8; 8] {
    fn from(value: ProtocolHeader) -> Self {
        [
            PROTOCOL_HEADER_PREFIX[0],
            PROTOCOL_HEADER_PREFIX[1],
            PROTOCOL_HEADER_PREFIX[2],
            PROTOCOL_HEADER_PREFIX[3],
            value.id as u8,
            value.major,
            value.minor,
            value.revision,
        ]
    }
}

impl From<ProtocolHeader> for Bytes {
    fn from(header: ProtocolHeader) -> Self {
        let bytes: [u8; 8] = header.into();
        Bytes::copy_from_slice(&bytes[..])
    }
}

impl TryFrom<[u8; 8]> for ProtocolHeader {
    type Error = [u8; 8];

    fn try_from(v: [u8; 8]) -> Result<Self, Self::Error> {
        if &v[..4] != PROTOCOL_HEADER_PREFIX {
            return Err(v);
        }
        let id = ProtocolId::try_from(v[4]).map_err(|_| v)?;
        Ok(Self::new(id, v[5], v[6], v[7]))
    }
}

/// Protocol id of the header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolId {
    /// Plain AMQP
    Amqp = 0x0,
    /// TLS negotiated before AMQP
    Tls = 0x2,
    /// SASL negotiated before AMQP
    Sasl = 0x3,
}

impl TryFrom<u8> for ProtocolId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Amqp),
            0x2 => Ok(Self::Tls),
            0x3 => Ok(Self::Sasl),
            _ => Err(value),
        }
    }
}
