//! Pipe handshake.
//!
//! Both ends write their header immediately after the stream is connected and
//! then read the peer's. A pipe is only usable once each side has verified
//! that the peer speaks the matching protocol.

use crate::WireError;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

/// Handshake header size in bytes
pub const HANDSHAKE_SIZE: usize = 8;

const MAGIC: [u8; 4] = [0x00, b'S', b'P', 0x00];

/// Messaging pattern spoken by a socket
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Exactly two endpoints
    Pair = 0x0010,
    /// Many-to-many mesh, every peer receives every message
    Bus = 0x0070,
}

impl Protocol {
    /// Protocol number announced in the handshake
    pub fn id(self) -> u16 {
        self as u16
    }

    /// Short lowercase name
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Pair => "pair",
            Protocol::Bus => "bus",
        }
    }
}

impl TryFrom<u16> for Protocol {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0010 => Ok(Protocol::Pair),
            0x0070 => Ok(Protocol::Bus),
            _ => Err(WireError::Protocol(value)),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pair" => Ok(Protocol::Pair),
            "bus" => Ok(Protocol::Bus),
            other => Err(format!("unknown protocol '{}', expected pair or bus", other)),
        }
    }
}

/// Handshake header exchanged at pipe setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol number of the sender
    pub protocol: u16,
}

impl Handshake {
    /// Header announcing `protocol`
    pub fn new(protocol: Protocol) -> Self {
        Self {
            protocol: protocol.id(),
        }
    }

    /// Encode the header
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(HANDSHAKE_SIZE);
        buf.put_slice(&MAGIC);
        buf.put_u16(self.protocol);
        buf.put_u16(0);
    }

    /// Encode into a fixed array, handy for `write_all`
    pub fn to_bytes(&self) -> [u8; HANDSHAKE_SIZE] {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_SIZE);
        self.encode(&mut buf);
        let mut out = [0u8; HANDSHAKE_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decode a header from exactly [`HANDSHAKE_SIZE`] bytes
    pub fn decode(mut raw: &[u8]) -> Result<Self, WireError> {
        if raw.len() < HANDSHAKE_SIZE || raw[..4] != MAGIC {
            return Err(WireError::Magic);
        }
        raw.advance(4);
        let protocol = raw.get_u16();
        if raw.get_u16() != 0 {
            return Err(WireError::Reserved);
        }
        Ok(Self { protocol })
    }

    /// Check that the peer header is acceptable for a socket speaking `ours`
    pub fn verify_peer(&self, ours: Protocol) -> Result<(), WireError> {
        if self.protocol != ours.id() {
            return Err(WireError::Incompatible {
                ours: ours.id(),
                peer: self.protocol,
            });
        }
        Ok(())
    }
}
