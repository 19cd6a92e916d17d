//! Chunk planning — how a compressed payload is cut into Chunk frames.

use crate::wire::FRAME_OVERHEAD;

/// How a payload of `payload_len` bytes maps onto Chunk frames for a given MTU.
///
/// Every Chunk frame is `FRAME_OVERHEAD + chunk_length` bytes at most, so a
/// frame never exceeds the negotiated MTU. A zero-length payload has no
/// chunks at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub payload_len: usize,
    pub chunk_length: usize,
    pub chunk_count: usize,
}

impl ChunkPlan {
    /// Plan chunks for a link with the given MTU, keeping `headroom` bytes of
    /// every write unused on top of the frame tag.
    pub fn new(payload_len: usize, mtu: usize, headroom: usize) -> Result<Self, ChunkError> {
        let chunk_length = headroom
            .checked_add(FRAME_OVERHEAD)
            .and_then(|reserved| mtu.checked_sub(reserved))
            .filter(|len| *len > 0)
            .ok_or(ChunkError::MtuTooSmall { mtu, headroom })?;

        Ok(Self {
            payload_len,
            chunk_length,
            chunk_count: payload_len.div_ceil(chunk_length),
        })
    }

    /// Iterate the chunks of `payload` in order. The last one may be shorter.
    pub fn chunks<'a>(&self, payload: &'a [u8]) -> std::slice::Chunks<'a, u8> {
        debug_assert_eq!(payload.len(), self.payload_len);
        payload.chunks(self.chunk_length)
    }

    /// Length of the final chunk; zero when there are no chunks.
    pub fn last_chunk_len(&self) -> usize {
        match self.payload_len % self.chunk_length {
            0 if self.payload_len == 0 => 0,
            0 => self.chunk_length,
            rem => rem,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("mtu {mtu} leaves no room for chunk data (headroom {headroom})")]
    MtuTooSmall { mtu: usize, headroom: usize },
}
