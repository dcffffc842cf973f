//! Asynchronous PAIR/BUS connections for ipc.
//!
//! A [`Connection`] wraps a transport socket with two queues. Outgoing
//! payloads are queued by [`Connection::send`] and drained to the transport
//! one at a time, in call order, by completion callbacks. Incoming messages
//! are collected by a self re-arming receive loop and polled with
//! [`Connection::dequeue_received`]. BUS connections can dial additional mesh
//! peers at runtime.
//!
//! Failures never panic. They are reported to pluggable [`LogSink`]s and
//! returned as [`IpcError`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use ipc_connection::{Connection, Side};
//! use ipc_wire::Protocol;
//!
//! # fn example() -> Result<(), ipc_connection::IpcError> {
//! let server = Connection::new();
//! server.start("inproc://example", Protocol::Pair, Side::Server)?;
//!
//! let client = Connection::new();
//! client.start("inproc://example", Protocol::Pair, Side::Client)?;
//! client.send(b"hello")?;
//!
//! std::thread::sleep(std::time::Duration::from_millis(100));
//! if let Some(msg) = server.dequeue_received() {
//!     println!("received {}", String::from_utf8_lossy(&msg));
//! }
//!
//! client.stop()?;
//! server.stop()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
mod inbound;
mod mesh;
pub mod options;
mod outbound;
pub mod sink;

// Re-export main types
pub use connection::{Connection, Role, Side};
pub use error::IpcError;
pub use ipc_wire::Protocol;
pub use options::Options;
pub use sink::{ConsoleSink, LogSink, TracingSink};
