//! Transport-level message buffer.

use crate::WireError;
use bytes::{Bytes, BytesMut};

/// A message owned by the transport while it is in flight.
///
/// The body is opaque. Building one from a payload is the only place where
/// a size limit is enforced on the sending side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    body: BytesMut,
}

impl Message {
    /// Empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty message with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            body: BytesMut::with_capacity(capacity),
        }
    }

    /// Copy `payload` into a new message, refusing bodies above `limit`
    pub fn from_payload(payload: &[u8], limit: usize) -> Result<Self, WireError> {
        if payload.len() > limit {
            return Err(WireError::Size {
                size: payload.len(),
                limit,
            });
        }
        let mut msg = Self::with_capacity(payload.len());
        msg.append(payload);
        Ok(msg)
    }

    /// Append bytes to the body
    pub fn append(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Body length
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Consume into an immutable buffer
    pub fn into_bytes(self) -> Bytes {
        self.body.freeze()
    }

    /// Consume into an owned vector
    pub fn into_vec(self) -> Vec<u8> {
        self.body.to_vec()
    }
}

impl From<Bytes> for Message {
    fn from(body: Bytes) -> Self {
        Self {
            body: BytesMut::from(&body[..]),
        }
    }
}
