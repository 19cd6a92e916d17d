//! Payload codec — compression and integrity digest.
//!
//! The checksum is always computed over the *compressed* bytes, which are
//! exactly the bytes that cross the link. The receiver verifies it after
//! reassembly and before decompressing.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// Length in characters of a hex checksum.
pub const CHECKSUM_HEX_LEN: usize = 64;

/// Compress `data` with zlib at `level` (0-9).
pub fn compress(data: &[u8], level: u32) -> Result<Vec<u8>, CodecError> {
    if level > 9 {
        return Err(CodecError::BadLevel(level));
    }
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level));
    encoder.write_all(data).map_err(CodecError::Compress)?;
    encoder.finish().map_err(CodecError::Compress)
}

/// Inflate `data`, refusing output longer than `limit` bytes.
pub fn decompress(data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(CodecError::Decompress)?;
    if out.len() as u64 > limit {
        return Err(CodecError::TooLarge { limit });
    }
    Ok(out)
}

/// SHA-256 of `data` as lowercase hex.
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Incremental checksum for payloads that arrive in pieces.
///
/// # Example
/// ```
/// use beamdrop_core::codec::{checksum, Checksum};
/// let mut c = Checksum::new();
/// c.update(b"hello ");
/// c.update(b"world");
/// assert_eq!(c.finalize(), checksum(b"hello world"));
/// ```
#[derive(Default)]
pub struct Checksum(Sha256);

impl Checksum {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.0.finalize())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("compression level {0} out of range 0-9")]
    BadLevel(u32),
    #[error("compression failed: {0}")]
    Compress(std::io::Error),
    #[error("decompression failed: {0}")]
    Decompress(std::io::Error),
    #[error("decompressed payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
}
