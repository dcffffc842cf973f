//! Byte streams for every supported scheme.
//!
//! This module provides the unified stream type carried by pipes together with
//! connect and bind helpers for TCP, unix domain sockets and in-process
//! endpoints.

use crate::address::Address;
use crate::TransportError;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::debug;

/// Buffer size of each direction of an in-process stream
const INPROC_BUFFER_SIZE: usize = 64 * 1024;

/// Pending in-process connections waiting to be accepted
const INPROC_BACKLOG: usize = 16;

/// In-process endpoints currently bound, by name
static INPROC_REGISTRY: Lazy<Mutex<HashMap<String, mpsc::Sender<DuplexStream>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Unified stream type for every scheme
pub enum IoStream {
    /// TCP stream
    Tcp(TcpStream),
    /// In-process stream
    Inproc(DuplexStream),
    /// Unix domain socket stream
    #[cfg(unix)]
    Ipc(UnixStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            IoStream::Inproc(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            IoStream::Ipc(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            IoStream::Inproc(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            IoStream::Ipc(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            IoStream::Inproc(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            IoStream::Ipc(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            IoStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            IoStream::Inproc(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            IoStream::Ipc(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl IoStream {
    /// Human readable description of the remote end
    pub fn peer(&self) -> String {
        match self {
            IoStream::Tcp(stream) => stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:unknown".to_string()),
            IoStream::Inproc(_) => "inproc".to_string(),
            #[cfg(unix)]
            IoStream::Ipc(_) => "ipc".to_string(),
        }
    }
}

/// Connect to `address`
pub async fn connect(address: &Address) -> Result<IoStream, TransportError> {
    match address {
        Address::Inproc(name) => connect_inproc(name).await,
        Address::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(IoStream::Tcp(stream))
        }
        #[cfg(unix)]
        Address::Ipc(path) => match UnixStream::connect(path).await {
            Ok(stream) => Ok(IoStream::Ipc(stream)),
            // A missing socket file means nobody is listening
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransportError::ConnectionRefused)
            }
            Err(e) => Err(e.into()),
        },
    }
}

async fn connect_inproc(name: &str) -> Result<IoStream, TransportError> {
    let acceptor = INPROC_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(name)
        .cloned()
        .ok_or(TransportError::ConnectionRefused)?;

    let (ours, theirs) = tokio::io::duplex(INPROC_BUFFER_SIZE);
    acceptor
        .send(theirs)
        .await
        .map_err(|_| TransportError::ConnectionRefused)?;
    Ok(IoStream::Inproc(ours))
}

/// Bound endpoint producing incoming streams
pub enum Acceptor {
    /// TCP listener
    Tcp(TcpListener),
    /// In-process listener
    Inproc {
        /// Registered name
        name: String,
        /// Incoming connections
        incoming: mpsc::Receiver<DuplexStream>,
    },
    /// Unix domain socket listener; the socket file is removed on drop
    #[cfg(unix)]
    Ipc {
        /// Listener
        listener: UnixListener,
        /// Socket file path, taken once the file is removed
        path: Option<std::path::PathBuf>,
    },
}

impl Acceptor {
    /// Bind `address`. Must be called within the transport runtime context.
    pub fn bind(address: &Address) -> Result<Self, TransportError> {
        match address {
            Address::Inproc(name) => {
                let mut registry = INPROC_REGISTRY
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if registry.get(name).is_some_and(|tx| !tx.is_closed()) {
                    return Err(TransportError::AddressInUse);
                }
                let (tx, rx) = mpsc::channel(INPROC_BACKLOG);
                registry.insert(name.clone(), tx);
                debug!("Bound inproc://{}", name);
                Ok(Acceptor::Inproc {
                    name: name.clone(),
                    incoming: rx,
                })
            }
            Address::Tcp { host, port } => {
                let listener =
                    std::net::TcpListener::bind((Address::bind_host(host), *port))?;
                listener.set_nonblocking(true)?;
                let listener = TcpListener::from_std(listener)?;
                debug!("Bound tcp://{}", listener.local_addr()?);
                Ok(Acceptor::Tcp(listener))
            }
            #[cfg(unix)]
            Address::Ipc(path) => {
                let listener = std::os::unix::net::UnixListener::bind(path)?;
                listener.set_nonblocking(true)?;
                let listener = UnixListener::from_std(listener)?;
                debug!("Bound ipc://{}", path.display());
                Ok(Acceptor::Ipc {
                    listener,
                    path: Some(path.clone()),
                })
            }
        }
    }

    /// Address actually bound, useful with `tcp://host:0`
    pub fn local_url(&self) -> Option<String> {
        match self {
            Acceptor::Tcp(listener) => listener
                .local_addr()
                .ok()
                .map(|addr| format!("tcp://{}", addr)),
            Acceptor::Inproc { name, .. } => Some(format!("inproc://{}", name)),
            #[cfg(unix)]
            Acceptor::Ipc { path, .. } => path.as_ref().map(|p| format!("ipc://{}", p.display())),
        }
    }

    /// Accept the next incoming stream
    pub async fn accept(&mut self) -> Result<IoStream, TransportError> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, _) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(IoStream::Tcp(stream))
            }
            Acceptor::Inproc { incoming, .. } => incoming
                .recv()
                .await
                .map(IoStream::Inproc)
                .ok_or(TransportError::Closed),
            #[cfg(unix)]
            Acceptor::Ipc { listener, .. } => {
                let (stream, _) = listener.accept().await?;
                Ok(IoStream::Ipc(stream))
            }
        }
    }

    /// Release the bound name right away instead of waiting for drop
    pub fn unbind(&mut self) {
        match self {
            Acceptor::Inproc { name, incoming } => {
                incoming.close();
                unregister_inproc(name);
            }
            Acceptor::Tcp(_) => {}
            #[cfg(unix)]
            Acceptor::Ipc { path, .. } => {
                if let Some(path) = path.take() {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Remove an inproc name whose acceptor is gone
pub(crate) fn unregister_inproc(name: &str) {
    let mut registry = INPROC_REGISTRY
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if registry.get(name).is_some_and(|tx| tx.is_closed()) {
        registry.remove(name);
        debug!("Released inproc://{}", name);
    }
}
