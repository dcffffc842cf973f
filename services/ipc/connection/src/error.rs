//! Connection error types.

use ipc_transport::TransportError;
use ipc_wire::WireError;
use thiserror::Error;

/// Connection errors.
///
/// Every error returned by a [`crate::Connection`] operation has already been
/// reported to the connection's error or warning sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IpcError {
    /// The connection is not started
    #[error("connection is not running")]
    NotRunning,

    /// `start` was called on a running connection
    #[error("connection is already running")]
    AlreadyRunning,

    /// Mesh peers need the bus protocol
    #[error("mesh peers are only supported with the bus protocol")]
    UnsupportedProtocol,

    /// The endpoint is already dialed or is the primary endpoint
    #[error("already connected to endpoint: {0}")]
    AlreadyConnected(String),

    /// The endpoint is not a mesh peer
    #[error("not connected to endpoint: {0}")]
    UnknownPeer(String),

    /// The payload could not be turned into a transport message
    #[error("message rejected: {0}")]
    Message(#[from] WireError),

    /// The transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = IpcError::AlreadyConnected("inproc://a".to_string());
        assert_eq!(err.to_string(), "already connected to endpoint: inproc://a");

        let err = IpcError::from(TransportError::ConnectionRefused);
        assert_eq!(err.to_string(), "transport error: connection refused");
    }
}
