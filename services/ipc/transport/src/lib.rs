//! Pair/bus sockets, dialers, listeners and asynchronous operation handles.
//!
//! This crate is the reliable messaging layer the ipc connection is built on.
//! It owns a small tokio runtime whose worker threads perform all I/O and run
//! every completion callback, so callers never need a runtime of their own.
//!
//! ## Features
//!
//! - **Schemes**: `inproc://name`, `tcp://host:port` and (unix) `ipc:///path`
//! - **Patterns**: PAIR (one peer) and BUS (broadcast mesh)
//! - **Dialers**: blocking or background start, reconnect with exponential backoff
//! - **Aio**: one outstanding send or receive per handle, completion callbacks,
//!   cooperative cancellation and a blocking `wait`
//!
//! ## Example
//!
//! ```rust,no_run
//! use ipc_transport::{Aio, AioResult, DialMode, Socket};
//! use ipc_wire::{Message, Protocol};
//!
//! # fn example() -> Result<(), ipc_transport::TransportError> {
//! let server = Socket::open(Protocol::Pair)?;
//! let listener = server.listener("inproc://example")?;
//! listener.start()?;
//!
//! let client = Socket::open(Protocol::Pair)?;
//! let dialer = client.dialer("inproc://example")?;
//! dialer.start(DialMode::Blocking)?;
//!
//! let aio = Aio::new(|_aio, result| {
//!     if let AioResult::Recv(Ok(msg)) = result {
//!         println!("received {} bytes", msg.len());
//!     }
//! })?;
//! server.recv_async(&aio)?;
//!
//! let send_aio = Aio::new(|_aio, _result| {})?;
//! client
//!     .send_async(&send_aio, Message::from_payload(b"hi", 1024).unwrap())
//!     .map_err(|(_, e)| e)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod aio;
pub mod dialer;
pub mod error;
pub mod listener;
mod pipe;
mod runtime;
pub mod socket;
pub mod stream;

// Re-export main types
pub use address::Address;
pub use aio::{Aio, AioResult};
pub use dialer::{DialMode, Dialer};
pub use error::TransportError;
pub use listener::Listener;
pub use socket::Socket;
pub use stream::IoStream;
