//! Transfer metadata — the single record sent before any chunk.

use serde::{Deserialize, Serialize};

use crate::codec::CHECKSUM_HEX_LEN;

/// Describes the payload that follows: its name, the checksum of the
/// compressed bytes, and how many Chunk frames carry them.
///
/// Encoded as compact JSON with the field names existing receivers expect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMetadata {
    pub filename: String,
    pub checksum: String,
    #[serde(rename = "chunkCount")]
    pub chunk_count: u64,
}

impl TransferMetadata {
    pub fn new(filename: impl Into<String>, checksum: impl Into<String>, chunk_count: u64) -> Self {
        Self {
            filename: filename.into(),
            checksum: checksum.into(),
            chunk_count,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and sanity-check a received record.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetadataError> {
        let meta: Self = serde_json::from_slice(bytes)?;
        let well_formed = meta.checksum.len() == CHECKSUM_HEX_LEN
            && meta.checksum.bytes().all(|b| b.is_ascii_hexdigit());
        if !well_formed {
            return Err(MetadataError::BadChecksum(meta.checksum));
        }
        Ok(meta)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("checksum {0:?} is not a {}-character hex digest", CHECKSUM_HEX_LEN)]
    BadChecksum(String),
}
