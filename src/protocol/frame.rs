//! Frame struct with typed accessors.
//!
//! A frame is the smallest wire-transmissible unit: header plus a payload
//! carrying (on the first frame of a message) a property block and a chunk
//! of the message body. Frames are transient: decoded, routed, and
//! discarded; nothing retains one past reassembly.

use bytes::Bytes;

use super::wire_format::{Header, HEADER_SIZE};
use crate::protocol::FrameKind;

/// A complete decoded protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: Header,
    /// Payload bytes (zero-copy via `bytes::Bytes`).
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// The message number this frame belongs to.
    #[inline]
    pub fn number(&self) -> u32 {
        self.header.number
    }

    /// The message type.
    #[inline]
    pub fn kind(&self) -> FrameKind {
        self.header.kind()
    }

    /// Whether more frames of this message follow.
    #[inline]
    pub fn more_coming(&self) -> bool {
        self.header.more_coming()
    }

    /// Whether the payload starts with a property block.
    #[inline]
    pub fn has_properties(&self) -> bool {
        self.header.has_properties()
    }
}

/// Build a complete frame as a single byte vector.
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    debug_assert_eq!(header.payload_len as usize, payload.len());
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::flags;

    #[test]
    fn test_frame_accessors() {
        let header = Header::new(7, flags::MORE_COMING | flags::HAS_PROPERTIES, 5);
        let frame = Frame::new(header, Bytes::from_static(b"hello"));

        assert_eq!(frame.number(), 7);
        assert_eq!(frame.kind(), FrameKind::Msg);
        assert!(frame.more_coming());
        assert!(frame.has_properties());
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[test]
    fn test_build_frame() {
        let header = Header::new(1, 1, 5);
        let bytes = build_frame(&header, b"reply");

        assert_eq!(bytes.len(), HEADER_SIZE + 5);
        let parsed = Header::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(&bytes[HEADER_SIZE..], b"reply");
    }

    #[test]
    fn test_build_frame_empty_payload() {
        let header = Header::new(1, 0, 0);
        let bytes = build_frame(&header, b"");
        assert_eq!(bytes.len(), HEADER_SIZE);
    }
}
