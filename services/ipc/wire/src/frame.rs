//! Length-prefixed message frames.

use crate::{Message, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Size of the length prefix in bytes
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default limit on a single message body (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Encode `body` as a single frame
pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u64(body.len() as u64);
    buf.put_slice(body);
    buf.freeze()
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_message_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a decoder refusing bodies larger than `max_message_size`
    pub fn with_limit(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    /// Current body size limit
    pub fn limit(&self) -> usize {
        self.max_message_size
    }

    /// Decode one frame from a buffer.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. An oversized
    /// length prefix is an error and the stream must be dropped.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_HEADER_SIZE];
        prefix.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let body_len = u64::from_be_bytes(prefix);

        if body_len > self.max_message_size as u64 {
            return Err(WireError::Size {
                size: usize::try_from(body_len).unwrap_or(usize::MAX),
                limit: self.max_message_size,
            });
        }
        let body_len = body_len as usize;

        if buf.len() < FRAME_HEADER_SIZE + body_len {
            buf.reserve(FRAME_HEADER_SIZE + body_len - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(body_len).freeze();
        trace!("Decoded frame with {} byte body", body_len);

        Ok(Some(Message::from(body)))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_partial_then_complete() {
        let frame = encode_frame(b"hello world");
        let mut decoder = FrameDecoder::new();

        let mut buf = BytesMut::from(&frame[..5]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[5..12]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[12..]);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.body(), b"hello world");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode_frame(b"one"));
        buf.extend_from_slice(&encode_frame(b""));
        buf.extend_from_slice(&encode_frame(b"three"));

        let mut decoder = FrameDecoder::new();
        let bodies: Vec<Vec<u8>> = std::iter::from_fn(|| decoder.decode(&mut buf).unwrap())
            .map(Message::into_vec)
            .collect();

        assert_eq!(bodies, vec![b"one".to_vec(), Vec::new(), b"three".to_vec()]);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut decoder = FrameDecoder::with_limit(4);
        let mut buf = BytesMut::from(&encode_frame(b"12345")[..]);

        assert_eq!(
            decoder.decode(&mut buf),
            Err(WireError::Size { size: 5, limit: 4 })
        );
    }
}
