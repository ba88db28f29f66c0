//! Brotli frame codec for chat envelopes.
//!
//! Outbound envelopes are serialized to JSON and, when compression is on,
//! brotli-compressed into a binary frame. If compression fails the JSON is
//! sent as a text frame instead. Inbound binary frames are decompressed
//! first; a payload that does not decompress is tried as plain JSON bytes.

use crate::error::{ChatError, Result};
use crate::transport::socket::Frame;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{Read, Write};
use tracing::{debug, warn};

/// Internal buffer size for the brotli reader/writer.
const BUFFER_SIZE: usize = 4096;
/// Brotli window size (log2).
const LG_WINDOW: u32 = 22;
/// Highest quality level brotli accepts.
const MAX_QUALITY: u32 = 11;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    quality: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(4)
    }
}

impl FrameCodec {
    #[must_use]
    pub fn new(quality: u32) -> Self {
        Self {
            quality: quality.min(MAX_QUALITY),
        }
    }

    /// Encode `value` as a frame, compressed when `compress` is set.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Protocol`] if `value` cannot be serialized.
    pub fn encode<T: Serialize>(&self, value: &T, compress: bool) -> Result<Frame> {
        let json = serde_json::to_string(value)
            .map_err(|e| ChatError::Protocol(format!("cannot serialize envelope: {e}")))?;
        if !compress {
            return Ok(Frame::Text(json));
        }
        match self.compress(json.as_bytes()) {
            Ok(bytes) => Ok(Frame::Binary(bytes)),
            Err(e) => {
                warn!("compression failed, sending plain JSON: {e}");
                Ok(Frame::Text(json))
            }
        }
    }

    /// Decode a frame into `T`.
    ///
    /// # Errors
    ///
    /// Returns [`ChatError::Protocol`] if the payload is not valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self, frame: &Frame) -> Result<T> {
        match frame {
            Frame::Text(text) => serde_json::from_str(text)
                .map_err(|e| ChatError::Protocol(format!("malformed text frame: {e}"))),
            Frame::Binary(bytes) => {
                match self.decompress(bytes) {
                    Ok(plain) => match serde_json::from_slice(&plain) {
                        Ok(value) => return Ok(value),
                        Err(e) => debug!("decompressed frame is not JSON: {e}"),
                    },
                    Err(e) => debug!("binary frame did not decompress, trying plain bytes: {e}"),
                }
                serde_json::from_slice(bytes)
                    .map_err(|e| ChatError::Protocol(format!("malformed binary frame: {e}")))
            }
        }
    }

    /// Brotli-compress `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the compressor fails.
    pub fn compress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut writer = brotli::CompressorWriter::new(Vec::new(), BUFFER_SIZE, self.quality, LG_WINDOW);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(writer.into_inner())
    }

    /// Brotli-decompress `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if `bytes` is not a valid brotli stream.
    pub fn decompress(&self, bytes: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(bytes.len() * 4);
        brotli::Decompressor::new(bytes, BUFFER_SIZE).read_to_end(&mut out)?;
        Ok(out)
    }
}
