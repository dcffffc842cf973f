//! Transport error types.

use ipc_wire::WireError;
use std::io;
use thiserror::Error;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Nobody is listening on the remote address
    #[error("connection refused")]
    ConnectionRefused,

    /// The remote end dropped the connection
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The address is already bound
    #[error("address in use")]
    AddressInUse,

    /// The address could not be parsed or is not supported
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The socket, dialer or listener has been closed
    #[error("object closed")]
    Closed,

    /// The operation was canceled
    #[error("operation canceled")]
    Canceled,

    /// The handle already has an operation outstanding, or the object is already started
    #[error("resource busy")]
    Busy,

    /// A peer did not finish the handshake in time
    #[error("timed out")]
    TimedOut,

    /// A message exceeded the configured size limit
    #[error("message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The peer speaks an incompatible protocol
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),

    /// The transport worker runtime could not be created
    #[error("transport runtime unavailable: {0}")]
    Runtime(String),

    /// Any other I/O failure
    #[error("i/o error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether dialing failed because the far side was not there
    pub fn is_refused(&self) -> bool {
        matches!(self, TransportError::ConnectionRefused)
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => TransportError::ConnectionReset,
            io::ErrorKind::AddrInUse => TransportError::AddressInUse,
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                TransportError::InvalidAddress(err.to_string())
            }
            io::ErrorKind::TimedOut => TransportError::TimedOut,
            _ => TransportError::Io(err.to_string()),
        }
    }
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Size { size, .. } => TransportError::MessageTooLarge(size),
            other => TransportError::ProtocolMismatch(other.to_string()),
        }
    }
}
