//! Incremental frame decoder.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::DEFAULT_MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};

/// Buffers raw bytes across reads and yields complete frames.
///
/// Bytes that do not yet form a complete frame stay buffered until the next
/// [`extend`](Self::extend).
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload: u32,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    pub fn with_max_payload(max_payload: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_payload,
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer, self.max_payload)
    }

    /// Drains every complete frame currently buffered.
    pub fn decode_all(&mut self) -> Result<Vec<Frame>, ProtocolError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Called at end of stream: leftover bytes mean the peer hung up mid-frame.
    pub fn finish(&self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::TruncatedFrame {
                buffered: self.buffer.len(),
            })
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
