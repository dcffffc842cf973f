//! Pair and bus sockets.
//!
//! A socket owns the pipes created by its dialers and listeners. Inbound
//! messages from every pipe are funneled into one receive queue. Outbound
//! routing depends on the protocol: PAIR feeds a single shared send queue
//! drained by the one connected pipe, BUS copies every message into the
//! private queue of each connected pipe.

use crate::aio::{Aio, AioResult};
use crate::dialer::Dialer;
use crate::listener::Listener;
use crate::{runtime, Address, TransportError};
use ipc_wire::{Message, Protocol, DEFAULT_MAX_MESSAGE_SIZE};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Depth of the socket receive queue and of each send queue
pub(crate) const QUEUE_DEPTH: usize = 128;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique id for sockets, endpoints and pipes
pub(crate) fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Where a pipe takes its outbound messages from
pub(crate) enum Outbox {
    /// PAIR: the socket-wide queue
    Shared(Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>),
    /// BUS: a queue of its own
    Own(mpsc::Receiver<Message>),
}

impl Outbox {
    pub(crate) async fn next(&mut self) -> Option<Message> {
        match self {
            Outbox::Shared(rx) => rx.lock().await.recv().await,
            Outbox::Own(rx) => rx.recv().await,
        }
    }
}

struct PipeEntry {
    endpoint: u64,
    /// BUS only
    outbox: Option<mpsc::Sender<Message>>,
}

/// Attached pipe; detaches itself from the socket when dropped
pub(crate) struct PipeRegistration {
    core: Arc<SocketCore>,
    pub(crate) id: u64,
    pub(crate) outbox: Outbox,
    pub(crate) recv_limit: usize,
}

impl Drop for PipeRegistration {
    fn drop(&mut self) {
        if self.core.pipes().remove(&self.id).is_some() {
            debug!("Pipe {} detached from socket {}", self.id, self.core.id);
        }
    }
}

pub(crate) struct SocketCore {
    pub(crate) id: u64,
    pub(crate) protocol: Protocol,
    pub(crate) handle: Handle,
    closed_tx: watch::Sender<bool>,
    pub(crate) recv_tx: mpsc::Sender<Message>,
    recv_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    pair_tx: mpsc::Sender<Message>,
    pair_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Message>>>,
    pipes: Mutex<HashMap<u64, PipeEntry>>,
    recv_max_size: AtomicUsize,
}

impl SocketCore {
    fn pipes(&self) -> MutexGuard<'_, HashMap<u64, PipeEntry>> {
        self.pipes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pipes attached through the dialer or listener `endpoint_id`
    pub(crate) fn pipes_for(&self, endpoint_id: u64) -> usize {
        self.pipes()
            .values()
            .filter(|p| p.endpoint == endpoint_id)
            .count()
    }

    pub(crate) fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Resolves once the socket is closed
    pub(crate) fn closed(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.closed_tx.subscribe();
        async move {
            let _ = rx.wait_for(|closed| *closed).await;
        }
    }

    /// Register a freshly handshaken pipe belonging to `endpoint`
    pub(crate) fn attach_pipe(
        self: &Arc<Self>,
        endpoint: u64,
    ) -> Result<PipeRegistration, TransportError> {
        let mut pipes = self.pipes();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let (outbox, entry) = match self.protocol {
            Protocol::Pair => {
                if !pipes.is_empty() {
                    debug!("Socket {} already has its pair peer, rejecting pipe", self.id);
                    return Err(TransportError::Busy);
                }
                (
                    Outbox::Shared(self.pair_rx.clone()),
                    PipeEntry {
                        endpoint,
                        outbox: None,
                    },
                )
            }
            Protocol::Bus => {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                (
                    Outbox::Own(rx),
                    PipeEntry {
                        endpoint,
                        outbox: Some(tx),
                    },
                )
            }
        };

        let id = next_id();
        pipes.insert(id, entry);
        debug!(
            "Pipe {} attached to socket {} ({} pipes)",
            id,
            self.id,
            pipes.len()
        );

        Ok(PipeRegistration {
            core: self.clone(),
            id,
            outbox,
            recv_limit: self.recv_max_size.load(Ordering::Relaxed),
        })
    }

    fn broadcast(&self, msg: &Message) -> usize {
        let pipes = self.pipes();
        let mut delivered = 0;
        for (id, entry) in pipes.iter() {
            if let Some(tx) = &entry.outbox {
                match tx.try_send(msg.clone()) {
                    Ok(()) => delivered += 1,
                    Err(_) => trace!("Pipe {} send queue full, dropping bus message", id),
                }
            }
        }
        delivered
    }
}

/// A PAIR or BUS socket.
///
/// Cloning is cheap; every clone refers to the same socket.
#[derive(Clone)]
pub struct Socket {
    pub(crate) core: Arc<SocketCore>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.core.id)
            .field("protocol", &self.core.protocol)
            .field("closed", &self.core.is_closed())
            .finish()
    }
}

impl Socket {
    /// Open a socket speaking `protocol`
    pub fn open(protocol: Protocol) -> Result<Self, TransportError> {
        let handle = runtime::handle()?;
        let (closed_tx, _) = watch::channel(false);
        let (recv_tx, recv_rx) = mpsc::channel(QUEUE_DEPTH);
        let (pair_tx, pair_rx) = mpsc::channel(QUEUE_DEPTH);

        let core = SocketCore {
            id: next_id(),
            protocol,
            handle,
            closed_tx,
            recv_tx,
            recv_rx: tokio::sync::Mutex::new(recv_rx),
            pair_tx,
            pair_rx: Arc::new(tokio::sync::Mutex::new(pair_rx)),
            pipes: Mutex::new(HashMap::new()),
            recv_max_size: AtomicUsize::new(DEFAULT_MAX_MESSAGE_SIZE),
        };
        debug!("Opened {} socket {}", protocol, core.id);

        Ok(Self {
            core: Arc::new(core),
        })
    }

    /// Socket id, unique within the process
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Protocol this socket speaks
    pub fn protocol(&self) -> Protocol {
        self.core.protocol
    }

    /// Whether [`Socket::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    /// Number of connected pipes
    pub fn pipe_count(&self) -> usize {
        self.core.pipes().len()
    }

    /// Number of connected pipes created by the dialer or listener with `endpoint_id`
    pub fn pipes_for(&self, endpoint_id: u64) -> usize {
        self.core.pipes_for(endpoint_id)
    }

    /// Largest message body accepted from peers; applies to pipes attached afterwards
    pub fn set_recv_max_size(&self, limit: usize) {
        self.core.recv_max_size.store(limit, Ordering::Relaxed);
    }

    /// Current receive size limit
    pub fn recv_max_size(&self) -> usize {
        self.core.recv_max_size.load(Ordering::Relaxed)
    }

    /// Create a dialer for `url`; it does nothing until started
    pub fn dialer(&self, url: &str) -> Result<Dialer, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let address = Address::parse(url)?;
        Ok(Dialer::new(self.core.clone(), url, address))
    }

    /// Create a listener for `url`; it does nothing until started
    pub fn listener(&self, url: &str) -> Result<Listener, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let address = Address::parse(url)?;
        Ok(Listener::new(self.core.clone(), url, address))
    }

    /// Send `msg` asynchronously; completion is reported to `aio`'s callback.
    ///
    /// PAIR sends wait for room in the send queue, so they stall while no peer
    /// is connected. BUS sends complete as soon as the message has been copied
    /// to every connected pipe. Returns the message if the handle is busy.
    pub fn send_async(&self, aio: &Aio, msg: Message) -> Result<(), (Message, TransportError)> {
        let ticket = match aio.reserve() {
            Ok(ticket) => ticket,
            Err(e) => return Err((msg, e)),
        };

        let core = self.core.clone();
        ticket.launch(move |cancel| async move {
            let closed = core.closed();
            match core.protocol {
                Protocol::Pair => {
                    tokio::select! {
                        biased;
                        _ = cancel => AioResult::Send(Err((msg, TransportError::Canceled))),
                        _ = closed => AioResult::Send(Err((msg, TransportError::Closed))),
                        permit = core.pair_tx.reserve() => match permit {
                            Ok(permit) => {
                                permit.send(msg);
                                AioResult::Send(Ok(()))
                            }
                            Err(_) => AioResult::Send(Err((msg, TransportError::Closed))),
                        },
                    }
                }
                Protocol::Bus => {
                    tokio::select! {
                        biased;
                        _ = cancel => AioResult::Send(Err((msg, TransportError::Canceled))),
                        _ = closed => AioResult::Send(Err((msg, TransportError::Closed))),
                        _ = std::future::ready(()) => {
                            let delivered = core.broadcast(&msg);
                            trace!("Bus message copied to {} pipes", delivered);
                            AioResult::Send(Ok(()))
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Receive the next message asynchronously; completion is reported to `aio`'s callback
    pub fn recv_async(&self, aio: &Aio) -> Result<(), TransportError> {
        let ticket = aio.reserve()?;

        let core = self.core.clone();
        ticket.launch(move |cancel| async move {
            let closed = core.closed();
            tokio::select! {
                biased;
                _ = cancel => AioResult::Recv(Err(TransportError::Canceled)),
                _ = closed => AioResult::Recv(Err(TransportError::Closed)),
                msg = async { core.recv_rx.lock().await.recv().await } => match msg {
                    Some(msg) => AioResult::Recv(Ok(msg)),
                    None => AioResult::Recv(Err(TransportError::Closed)),
                },
            }
        });
        Ok(())
    }

    /// Close the socket. Pending and future operations fail with `Closed`
    /// and every pipe is torn down.
    pub fn close(&self) {
        if self.core.closed_tx.send_replace(true) {
            return;
        }
        let dropped = {
            let mut pipes = self.core.pipes();
            let count = pipes.len();
            pipes.clear();
            count
        };
        info!(
            "Closed socket {} ({} pipes dropped)",
            self.core.id, dropped
        );
    }
}
