//! Decompression filter for compressed image payloads.
//!
//! A compressed image payload starts with a fixed 16-byte header followed by
//! an LZ4 block with its uncompressed size prepended:
//!
//! ```text
//! offset  size  field
//! 0       4     magic "LZ4C"
//! 4       4     PFNC pixel format (LE)
//! 8       4     width (LE)
//! 12      4     height (LE)
//! 16      ..    lz4_flex::compress_prepend_size(pixels)
//! ```
//!
//! LZ4 keeps decompression well under a frame period for typical sensor
//! sizes, so it runs inline on the acquisition thread.

use thiserror::Error;

use super::PixelFormat;

/// Magic prefix of a compressed image payload.
pub const COMPRESSED_MAGIC: [u8; 4] = *b"LZ4C";

/// Size of the fixed header preceding the LZ4 block.
pub const HEADER_LEN: usize = 16;

/// Errors raised while reading or decompressing a compressed payload.
#[derive(Error, Debug)]
pub enum DecompressError {
    #[error("payload does not carry a compressed image header")]
    NotCompressed,

    #[error("compressed header truncated ({0} bytes)")]
    TruncatedHeader(usize),

    #[error("declared decompressed size {declared} exceeds the {limit} byte limit")]
    Oversized { declared: usize, limit: usize },

    #[error("LZ4 decompression failed: {0}")]
    Lz4(#[from] lz4_flex::block::DecompressError),
}

/// Image format a compressed payload expands to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputFormat {
    /// Pixel format after decompression.
    pub pixel_format: PixelFormat,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl OutputFormat {
    /// Size in bytes the decompressed image must have, or `None` when the
    /// pixel format has no known pixel size.
    #[must_use]
    pub fn expected_size(&self) -> Option<usize> {
        self.pixel_format.image_size(self.width, self.height)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(at..at + 4)?.try_into().ok()?;
    Some(u32::from_le_bytes(raw))
}

/// Stateful decompressor owning the scratch output buffer.
///
/// The slice returned by [`DecompressionFilter::execute`] borrows the scratch
/// buffer and stays valid until the next call.
#[derive(Debug, Default)]
pub struct DecompressionFilter {
    scratch: Vec<u8>,
    executed: u64,
}

impl DecompressionFilter {
    /// Create a filter with an empty scratch buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `payload` really is a compressed image.
    #[must_use]
    pub fn is_compressed(payload: &[u8]) -> bool {
        payload.starts_with(&COMPRESSED_MAGIC)
    }

    /// Read the output format from the header.
    pub fn output_format_for(payload: &[u8]) -> Result<OutputFormat, DecompressError> {
        if !Self::is_compressed(payload) {
            return Err(DecompressError::NotCompressed);
        }
        let field = |at| read_u32(payload, at).ok_or(DecompressError::TruncatedHeader(payload.len()));
        Ok(OutputFormat {
            pixel_format: PixelFormat::from_raw(field(4)?),
            width: field(8)?,
            height: field(12)?,
        })
    }

    /// Decompress `payload` into the scratch buffer.
    ///
    /// The block's declared size is checked against `limit` before the
    /// scratch buffer grows.
    pub fn execute(&mut self, payload: &[u8], limit: usize) -> Result<&[u8], DecompressError> {
        if !Self::is_compressed(payload) {
            return Err(DecompressError::NotCompressed);
        }
        let declared = read_u32(payload, HEADER_LEN)
            .ok_or(DecompressError::TruncatedHeader(payload.len()))? as usize;
        if declared > limit {
            return Err(DecompressError::Oversized { declared, limit });
        }
        let block = &payload[HEADER_LEN + 4..];

        self.scratch.clear();
        self.scratch.resize(declared, 0);
        let written = lz4_flex::block::decompress_into(block, &mut self.scratch)?;
        self.scratch.truncate(written);
        self.executed += 1;
        Ok(&self.scratch)
    }

    /// Number of successful decompressions.
    #[must_use]
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

/// Build a compressed image payload (header + LZ4 block).
///
/// Used by simulated devices; a real device produces this on the wire.
#[must_use]
pub fn compress_image(format: &OutputFormat, pixels: &[u8]) -> Vec<u8> {
    let block = lz4_flex::compress_prepend_size(pixels);
    let mut payload = Vec::with_capacity(HEADER_LEN + block.len());
    payload.extend_from_slice(&COMPRESSED_MAGIC);
    payload.extend_from_slice(&format.pixel_format.to_raw().to_le_bytes());
    payload.extend_from_slice(&format.width.to_le_bytes());
    payload.extend_from_slice(&format.height.to_le_bytes());
    payload.extend_from_slice(&block);
    payload
}
