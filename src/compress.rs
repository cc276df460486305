//! Whole-body gzip compression.
//!
//! Compression is applied once to a complete message body before it is split
//! into frames, and undone only after the final frame has been reassembled.
//! Decompression is capped: a body that inflates past the configured maximum
//! is rejected as [`BadData`](crate::FramewireError::BadData) instead of
//! allocating without bound.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{FramewireError, Result};

/// Compress a message body with gzip.
pub fn compress_body(body: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(5));
    encoder.write_all(body)?;
    Ok(encoder.finish()?)
}

/// Decompress a received message body, allowing at most `max_size` bytes out.
pub fn decompress_body(body: &[u8], max_size: usize) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(body).take(max_size as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| FramewireError::BadData(format!("gzip decode failed: {}", e)))?;
    if out.len() > max_size {
        return Err(FramewireError::BadData(format!(
            "decompressed body exceeds maximum {} bytes",
            max_size
        )));
    }
    Ok(out)
}
