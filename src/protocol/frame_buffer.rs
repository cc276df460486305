//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management and a two-state
//! machine for handling fragmented frames:
//! - `WaitingForHeader`: need at least 7 bytes
//! - `WaitingForPayload`: header parsed and validated, need N more bytes
//!
//! Headers are validated before their payload length is trusted, so a
//! malformed or oversized frame is rejected without consuming unbounded
//! input.

use bytes::{Bytes, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_PAYLOAD, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from stream reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed frame payload size.
    max_payload: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with the default maximum payload.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_PAYLOAD)
    }

    /// Create a frame buffer with a custom maximum payload size.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
            state: State::WaitingForHeader,
            max_payload,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push. Returns
    /// [`FramewireError::BadFrame`](crate::FramewireError::BadFrame) if a
    /// header fails validation; the buffer must not be reused afterwards.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        match &self.state {
            State::WaitingForHeader => {
                if self.buffer.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let header =
                    Header::decode(&self.buffer[..HEADER_SIZE]).expect("buffer has enough bytes");
                header.validate(self.max_payload)?;

                let _ = self.buffer.split_to(HEADER_SIZE);

                if header.payload_len == 0 {
                    return Ok(Some(Frame::new(header, Bytes::new())));
                }

                self.state = State::WaitingForPayload { header };
                self.try_extract_one()
            }

            State::WaitingForPayload { header } => {
                let needed = header.payload_len as usize;
                if self.buffer.len() < needed {
                    return Ok(None);
                }

                let payload = self.buffer.split_to(needed).freeze();
                let header = *header;
                self.state = State::WaitingForHeader;

                Ok(Some(Frame::new(header, payload)))
            }
        }
    }

    /// Number of buffered bytes not yet parsed into frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
