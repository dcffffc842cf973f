//! Connection lifecycle: socket, dialers, listeners and operation handles.

use crate::error::IpcError;
use crate::options::Options;
use crate::sink::{default_error_sink, default_warn_sink, LogSink};
use crate::{inbound, outbound};
use ipc_transport::{Aio, DialMode, Dialer, Listener, Socket, TransportError};
use ipc_wire::Protocol;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::{debug, info};

/// How [`Connection::start`] reaches the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Dial the endpoint; failing to connect is fatal
    Client,
    /// Listen on the endpoint
    Server,
    /// Dial, and listen instead if nobody answers
    #[default]
    Any,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Client => "client",
            Side::Server => "server",
            Side::Any => "any",
        })
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(Side::Client),
            "server" => Ok(Side::Server),
            "any" => Ok(Side::Any),
            other => Err(format!(
                "unknown side '{}', expected client, server or any",
                other
            )),
        }
    }
}

/// What a started connection ended up doing on its primary endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The endpoint was dialed
    Dialer,
    /// The endpoint is being listened on
    Listener,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Dialer => "dialer",
            Role::Listener => "listener",
        })
    }
}

pub(crate) struct ConnState {
    pub(crate) protocol: Protocol,
    pub(crate) side: Side,
    pub(crate) role: Option<Role>,
    pub(crate) endpoint: String,
    pub(crate) options: Options,
    /// Dialed endpoints, index-aligned with `dialers`
    pub(crate) peers: Vec<String>,
    pub(crate) dialers: Vec<Dialer>,
    pub(crate) listeners: Vec<Listener>,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            protocol: Protocol::Pair,
            side: Side::default(),
            role: None,
            endpoint: String::new(),
            options: Options::default(),
            peers: Vec::new(),
            dialers: Vec::new(),
            listeners: Vec::new(),
        }
    }
}

/// Transport handles of a running connection
pub(crate) struct Io {
    pub(crate) socket: Socket,
    pub(crate) in_aio: Aio,
    pub(crate) out_aio: Aio,
    pub(crate) max_message_size: usize,
}

pub(crate) struct Shared {
    pub(crate) running: AtomicBool,
    /// Only read or written under the `outbound` lock
    pub(crate) sending: AtomicBool,
    state: Mutex<ConnState>,
    io: Mutex<Option<Arc<Io>>>,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    outbound: Mutex<VecDeque<Vec<u8>>>,
    error_sink: RwLock<Arc<dyn LogSink>>,
    warn_sink: RwLock<Arc<dyn LogSink>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            sending: AtomicBool::new(false),
            state: Mutex::new(ConnState::default()),
            io: Mutex::new(None),
            inbound: Mutex::new(VecDeque::new()),
            outbound: Mutex::new(VecDeque::new()),
            error_sink: RwLock::new(default_error_sink()),
            warn_sink: RwLock::new(default_warn_sink()),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn io_slot(&self) -> MutexGuard<'_, Option<Arc<Io>>> {
        self.io.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles of the running connection, if any
    pub(crate) fn io(&self) -> Option<Arc<Io>> {
        self.io_slot().clone()
    }

    pub(crate) fn inbound(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn outbound(&self) -> MutexGuard<'_, VecDeque<Vec<u8>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Report to the error sink
    pub(crate) fn error(&self, message: &str, cause: Option<&dyn fmt::Display>) {
        let sink = self
            .error_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let detail = cause.map(|c| c.to_string());
        sink.log(message, detail.as_deref());
    }

    /// Report to the warning sink
    pub(crate) fn warn(&self, message: &str, cause: Option<&dyn fmt::Display>) {
        let sink = self
            .warn_sink
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let detail = cause.map(|c| c.to_string());
        sink.log(message, detail.as_deref());
    }

    /// Report a fatal transport failure and convert it
    pub(crate) fn fail(&self, message: &str, err: TransportError) -> IpcError {
        self.error(message, Some(&err));
        err.into()
    }

    /// Report a failed completion. Cancellations caused by `stop` are expected
    /// and only traced.
    pub(crate) fn transient(&self, message: &str, err: &TransportError) {
        let quiescing = !self.is_running()
            && matches!(err, TransportError::Canceled | TransportError::Closed);
        if quiescing {
            debug!("{} during shutdown: {}", message, err);
        } else {
            self.warn(message, Some(err));
        }
    }

    /// Dialer for `endpoint` with the reconnect options applied
    pub(crate) fn dialer(
        &self,
        socket: &Socket,
        endpoint: &str,
        options: &Options,
    ) -> Result<Dialer, IpcError> {
        let mut dialer = socket
            .dialer(endpoint)
            .map_err(|e| self.fail(&format!("failed to create dialer for {}", endpoint), e))?;
        dialer.set_reconnect_min(options.reconnect);
        dialer.set_reconnect_max(options.timeout);
        Ok(dialer)
    }

    fn listen(&self, socket: &Socket, endpoint: &str, start_failure: &str) -> Result<Listener, IpcError> {
        let listener = socket
            .listener(endpoint)
            .map_err(|e| self.fail(&format!("failed to create listener on {}", endpoint), e))?;
        listener
            .start()
            .map_err(|e| self.fail(start_failure, e))?;
        Ok(listener)
    }

    /// Resolve `side` into a dialer or listener on `socket`
    fn establish(
        &self,
        socket: &Socket,
        endpoint: &str,
        side: Side,
        options: &Options,
    ) -> Result<Endpoint, IpcError> {
        match side {
            Side::Server => {
                let listener = self.listen(
                    socket,
                    endpoint,
                    &format!("failed to start listener on {}", endpoint),
                )?;
                Ok(Endpoint::Listener(listener))
            }
            Side::Client => {
                let dialer = self.dialer(socket, endpoint, options)?;
                dialer
                    .start(DialMode::Blocking)
                    .map_err(|e| self.fail("failed to dial the requested endpoint", e))?;
                Ok(Endpoint::Dialer(dialer))
            }
            Side::Any => {
                let dialer = self.dialer(socket, endpoint, options)?;
                match dialer.start(DialMode::Blocking) {
                    Ok(()) => Ok(Endpoint::Dialer(dialer)),
                    Err(TransportError::ConnectionRefused | TransportError::ConnectionReset) => {
                        dialer.close();
                        debug!("Nobody answered on {}, listening instead", endpoint);
                        let listener = self.listen(
                            socket,
                            endpoint,
                            &format!("failed to listen on {} after dial failed", endpoint),
                        )?;
                        Ok(Endpoint::Listener(listener))
                    }
                    Err(e) => Err(self.fail(
                        &format!("failed to establish connection on {}", endpoint),
                        e,
                    )),
                }
            }
        }
    }

    /// Release every transport resource and reset the connection to its idle state.
    ///
    /// The caller holds the state lock. Both handles are canceled and waited on
    /// before anything they use is closed.
    fn teardown(&self, state: &mut ConnState) {
        self.running.store(false, Ordering::SeqCst);

        let io = self.io_slot().take();
        if let Some(io) = &io {
            io.in_aio.cancel();
            io.out_aio.cancel();
            io.in_aio.wait();
            io.out_aio.wait();
        }

        for dialer in state.dialers.drain(..) {
            dialer.close();
        }
        for listener in state.listeners.drain(..) {
            listener.close();
        }
        state.peers.clear();

        if let Some(io) = io {
            io.socket.close();
        }

        {
            let mut queue = self.outbound();
            queue.clear();
            self.sending.store(false, Ordering::SeqCst);
        }
        self.inbound().clear();

        state.endpoint.clear();
        state.role = None;
    }
}

enum Endpoint {
    Dialer(Dialer),
    Listener(Listener),
}

/// An asynchronous PAIR or BUS connection.
///
/// Sends are queued and handed to the transport one at a time in call order.
/// Received messages are queued until polled with
/// [`Connection::dequeue_received`]. All I/O and completion handling happens on
/// transport worker threads, so no method blocks except `start`, which waits
/// for the first dial attempt, and `stop`, which waits for pending operations
/// to finish.
///
/// A stopped connection can be started again. Dropping a running connection
/// stops it.
pub struct Connection {
    pub(crate) shared: Arc<Shared>,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("running", &self.is_running())
            .field("protocol", &self.protocol())
            .field("endpoint", &self.endpoint())
            .finish()
    }
}

impl Connection {
    /// Idle connection with default options and console sinks
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::new()),
        }
    }

    /// Replace the options used by the next `start` and `add_mesh_peer`
    pub fn set_opts(&self, options: Options) {
        self.shared.state().options = options;
    }

    /// Replace the error sink; `None` restores the console sink
    pub fn set_error_cb(&self, sink: Option<Arc<dyn LogSink>>) {
        *self
            .shared
            .error_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink.unwrap_or_else(default_error_sink);
    }

    /// Replace the warning sink; `None` restores the console sink
    pub fn set_warn_cb(&self, sink: Option<Arc<dyn LogSink>>) {
        *self
            .shared
            .warn_sink
            .write()
            .unwrap_or_else(PoisonError::into_inner) = sink.unwrap_or_else(default_warn_sink);
    }

    /// Start a PAIR connection that dials `endpoint` or listens if nobody answers
    pub fn start_default(&self, endpoint: &str) -> Result<(), IpcError> {
        self.start(endpoint, Protocol::Pair, Side::Any)
    }

    /// Open the socket, reach `endpoint` according to `side` and begin receiving.
    ///
    /// Every failure is reported to the error sink and leaves the connection
    /// stopped with nothing allocated.
    pub fn start(&self, endpoint: &str, protocol: Protocol, side: Side) -> Result<(), IpcError> {
        let shared = &self.shared;
        let mut state = shared.state();

        if shared.is_running() {
            let err = IpcError::AlreadyRunning;
            shared.error(&err.to_string(), None);
            return Err(err);
        }

        state.protocol = protocol;
        state.side = side;
        let options = state.options;

        let socket = Socket::open(protocol)
            .map_err(|e| shared.fail(&format!("failed to create a {} socket", protocol), e))?;
        socket.set_recv_max_size(options.max_message_size);

        let established = match shared.establish(&socket, endpoint, side, &options) {
            Ok(established) => established,
            Err(e) => {
                socket.close();
                return Err(e);
            }
        };

        let handles = Aio::new(inbound::handler(Arc::downgrade(shared), socket.clone()))
            .map_err(|e| shared.fail("failed to allocate input aio", e))
            .and_then(|in_aio| {
                Aio::new(outbound::handler(
                    Arc::downgrade(shared),
                    socket.clone(),
                    options.max_message_size,
                ))
                .map(|out_aio| (in_aio, out_aio))
                .map_err(|e| shared.fail("failed to allocate output aio", e))
            });
        let (in_aio, out_aio) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                drop(established);
                socket.close();
                return Err(e);
            }
        };

        let role = match established {
            Endpoint::Dialer(dialer) => {
                state.peers.push(endpoint.to_string());
                state.dialers.push(dialer);
                Role::Dialer
            }
            Endpoint::Listener(listener) => {
                state.listeners.push(listener);
                Role::Listener
            }
        };
        state.role = Some(role);
        state.endpoint = endpoint.to_string();

        *shared.io_slot() = Some(Arc::new(Io {
            socket: socket.clone(),
            in_aio: in_aio.clone(),
            out_aio,
            max_message_size: options.max_message_size,
        }));
        shared.sending.store(false, Ordering::SeqCst);
        shared.running.store(true, Ordering::SeqCst);

        // Kick off the receive loop; it re-arms itself from here on
        if let Err(e) = socket.recv_async(&in_aio) {
            let err = shared.fail("failed to start receiving", e);
            shared.teardown(&mut state);
            return Err(err);
        }

        info!(
            "Started {} connection on {} as {} ({})",
            protocol, endpoint, role, side
        );
        Ok(())
    }

    /// Cancel pending operations, wait for them and release every transport resource.
    ///
    /// Returns [`IpcError::NotRunning`] without side effects or logging if the
    /// connection is already stopped. Must not be called from a sink invoked
    /// by this connection's completion handling.
    pub fn stop(&self) -> Result<(), IpcError> {
        let mut state = self.shared.state();
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return Err(IpcError::NotRunning);
        }

        let endpoint = state.endpoint.clone();
        self.shared.teardown(&mut state);
        info!("Stopped connection on {}", endpoint);
        Ok(())
    }

    /// Whether the connection is started
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Whether a send is in flight
    pub fn is_sending(&self) -> bool {
        let _queue = self.shared.outbound();
        self.shared.sending.load(Ordering::SeqCst)
    }

    /// Protocol of the last `start`, PAIR before the first one
    pub fn protocol(&self) -> Protocol {
        self.shared.state().protocol
    }

    /// Side requested by the last `start`
    pub fn side(&self) -> Side {
        self.shared.state().side
    }

    /// Whether the primary endpoint was dialed or listened on; `None` while stopped
    pub fn role(&self) -> Option<Role> {
        self.shared.state().role
    }

    /// Primary endpoint; empty while stopped
    pub fn endpoint(&self) -> String {
        self.shared.state().endpoint.clone()
    }

    /// Dialed endpoints in the order they were added
    pub fn peers(&self) -> Vec<String> {
        self.shared.state().peers.clone()
    }

    /// Number of live dialers; always equal to `peers().len()`
    pub fn dialer_count(&self) -> usize {
        self.shared.state().dialers.len()
    }

    /// Options in force for the next dialer
    pub fn options(&self) -> Options {
        self.shared.state().options
    }

    /// Messages waiting to be handed to the transport
    pub fn pending_outbound(&self) -> usize {
        self.shared.outbound().len()
    }

    /// Received messages not yet dequeued
    pub fn pending_inbound(&self) -> usize {
        self.shared.inbound().len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recording() -> (Arc<dyn LogSink>, Arc<Mutex<Vec<String>>>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = lines.clone();
        let sink: Arc<dyn LogSink> = Arc::new(move |msg: &str, _: Option<&str>| {
            captured.lock().unwrap().push(msg.to_string());
        });
        (sink, lines)
    }

    #[test]
    fn test_side_parse() {
        assert_eq!("Client".parse::<Side>().unwrap(), Side::Client);
        assert_eq!("server".parse::<Side>().unwrap(), Side::Server);
        assert_eq!("ANY".parse::<Side>().unwrap(), Side::Any);
        assert!("both".parse::<Side>().is_err());
        assert_eq!(Side::default(), Side::Any);
    }

    #[test]
    fn test_new_connection_is_idle() {
        let conn = Connection::new();
        assert!(!conn.is_running());
        assert!(!conn.is_sending());
        assert_eq!(conn.protocol(), Protocol::Pair);
        assert_eq!(conn.role(), None);
        assert!(conn.endpoint().is_empty());
        assert!(conn.peers().is_empty());
        assert_eq!(conn.options(), Options::default());
    }

    #[test]
    fn test_stop_when_stopped_is_silent() {
        let conn = Connection::new();
        let (sink, lines) = recording();
        conn.set_error_cb(Some(sink.clone()));
        conn.set_warn_cb(Some(sink));

        assert_eq!(conn.stop(), Err(IpcError::NotRunning));
        assert!(lines.lock().unwrap().is_empty());
    }

    #[test]
    fn test_start_twice_reports_error() {
        let conn = Connection::new();
        let (sink, lines) = recording();
        conn.set_error_cb(Some(sink));

        conn.start("inproc://conn_unit_twice", Protocol::Pair, Side::Server)
            .unwrap();
        assert_eq!(
            conn.start("inproc://conn_unit_twice", Protocol::Pair, Side::Server),
            Err(IpcError::AlreadyRunning)
        );
        assert_eq!(lines.lock().unwrap().len(), 1);
        assert_eq!(conn.endpoint(), "inproc://conn_unit_twice");

        conn.stop().unwrap();
        assert!(conn.endpoint().is_empty());
        assert_eq!(conn.role(), None);
    }

    #[test]
    fn test_invalid_address_is_fatal() {
        let conn = Connection::new();
        let (sink, lines) = recording();
        conn.set_error_cb(Some(sink));

        let err = conn
            .start("smoke-signal://hill", Protocol::Bus, Side::Server)
            .unwrap_err();
        assert!(matches!(
            err,
            IpcError::Transport(TransportError::InvalidAddress(_))
        ));
        assert!(!conn.is_running());
        assert_eq!(
            lines.lock().unwrap().as_slice(),
            ["failed to create listener on smoke-signal://hill"]
        );
    }

    #[test]
    fn test_options_apply_to_dialers() {
        let conn = Connection::new();
        let opts = Options {
            reconnect: std::time::Duration::from_millis(5),
            ..Options::default()
        };
        conn.set_opts(opts);
        assert_eq!(conn.options().reconnect, std::time::Duration::from_millis(5));
    }

    #[test]
    fn test_restart_after_stop() {
        let conn = Connection::new();
        for _ in 0..3 {
            conn.start("inproc://conn_unit_restart", Protocol::Bus, Side::Any)
                .unwrap();
            assert_eq!(conn.role(), Some(Role::Listener));
            conn.stop().unwrap();
        }
    }

    #[test]
    fn test_drop_stops_and_frees_endpoint() {
        {
            let conn = Connection::new();
            conn.start("inproc://conn_unit_drop", Protocol::Pair, Side::Server)
                .unwrap();
        }
        let again = Connection::new();
        assert!(again
            .start("inproc://conn_unit_drop", Protocol::Pair, Side::Server)
            .is_ok());
    }
}
