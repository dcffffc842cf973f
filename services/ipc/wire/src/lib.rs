//! Pipe handshake, length-prefixed framing and message buffers for ipc.
//!
//! Every byte stream carried by the transport (TCP, unix socket or an
//! in-process duplex) starts with a fixed handshake and then carries a
//! sequence of frames. Payloads are opaque; nothing here inspects them.
//!
//! ## Wire Format
//!
//! ```text
//! handshake (once per pipe, both directions):
//! +------+------+------+------+-----------------+-----------+
//! | 0x00 | 'S'  | 'P'  | 0x00 | protocol u16 BE | reserved  |
//! +------+------+------+------+-----------------+-----------+
//!
//! frame (repeated):
//! +----------------------+----------------------------+
//! | u64 body_len (BE)    | length of bytes that follow|
//! +----------------------+----------------------------+
//! | body                 | opaque payload             |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;

// Re-export main types
pub use error::WireError;
pub use frame::{encode_frame, FrameDecoder, DEFAULT_MAX_MESSAGE_SIZE, FRAME_HEADER_SIZE};
pub use handshake::{Handshake, Protocol, HANDSHAKE_SIZE};
pub use message::Message;
