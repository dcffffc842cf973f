//! Mesh peers of a BUS connection.

use crate::connection::Connection;
use crate::error::IpcError;
use ipc_transport::{DialMode, TransportError};
use ipc_wire::Protocol;
use tracing::{debug, info};

impl Connection {
    /// Dial one more BUS peer with the connection's reconnect options.
    ///
    /// A peer that is not up yet is still added; its dialer keeps retrying in
    /// the background. Dialing the primary endpoint or an existing peer again
    /// is refused with a warning.
    pub fn add_mesh_peer(&self, endpoint: &str) -> Result<(), IpcError> {
        let shared = &self.shared;
        let mut state = shared.state();

        if state.protocol != Protocol::Bus {
            let err = IpcError::UnsupportedProtocol;
            shared.error(&err.to_string(), None);
            return Err(err);
        }

        let io = match shared.io() {
            Some(io) if shared.is_running() => io,
            _ => {
                shared.error("cannot add peers to a stopped connection", None);
                return Err(IpcError::NotRunning);
            }
        };

        if state.endpoint == endpoint || state.peers.iter().any(|p| p == endpoint) {
            let err = IpcError::AlreadyConnected(endpoint.to_string());
            shared.warn(&err.to_string(), None);
            return Err(err);
        }

        let options = state.options;
        let dialer = shared.dialer(&io.socket, endpoint, &options)?;
        match dialer.start(DialMode::Blocking) {
            Ok(()) => {}
            Err(TransportError::ConnectionRefused) => {
                debug!("Mesh peer {} is not up yet, dialing in the background", endpoint);
            }
            Err(e) => {
                dialer.close();
                return Err(shared.fail(&format!("failed to start dialer for {}", endpoint), e));
            }
        }

        state.peers.push(endpoint.to_string());
        state.dialers.push(dialer);
        info!("Added mesh peer {} ({} peers)", endpoint, state.peers.len());
        Ok(())
    }

    /// Stop dialing a peer added with [`Connection::add_mesh_peer`]
    pub fn remove_mesh_peer(&self, endpoint: &str) -> Result<(), IpcError> {
        let shared = &self.shared;
        let mut state = shared.state();

        if state.protocol != Protocol::Bus {
            let err = IpcError::UnsupportedProtocol;
            shared.error(&err.to_string(), None);
            return Err(err);
        }

        let Some(index) = state.peers.iter().position(|p| p == endpoint) else {
            let err = IpcError::UnknownPeer(endpoint.to_string());
            shared.warn(&err.to_string(), None);
            return Err(err);
        };

        if index < state.dialers.len() {
            state.dialers.remove(index).close();
        }
        state.peers.remove(index);
        info!("Removed mesh peer {} ({} peers)", endpoint, state.peers.len());
        Ok(())
    }
}
