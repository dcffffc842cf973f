//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Message or frame is larger than the configured limit
    #[error("size limit exceeded: {size} > {limit}")]
    Size {
        /// Offending size in bytes
        size: usize,
        /// Limit that was in force
        limit: usize,
    },

    /// Handshake header did not start with the expected magic
    #[error("bad handshake magic")]
    Magic,

    /// Reserved handshake bytes nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Unknown protocol number in the handshake
    #[error("unknown protocol {0:#06x}")]
    Protocol(u16),

    /// Peer speaks a protocol we cannot pair with
    #[error("incompatible peer protocol {peer:#06x} for {ours:#06x}")]
    Incompatible {
        /// Our protocol number
        ours: u16,
        /// The number announced by the peer
        peer: u16,
    },
}
