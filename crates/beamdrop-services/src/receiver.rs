//! Transfer receiver — the accepting side of one file transfer.
//!
//! Answers the handshake, collects chunks with one acknowledgment each,
//! and verifies the reassembled payload against the metadata before
//! anything is written to disk. A rejected frame is answered with NAK
//! and ends the transfer.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::{Bytes, BytesMut};

use beamdrop_core::codec::{self, Checksum, CodecError};
use beamdrop_core::config::BeamdropConfig;
use beamdrop_core::wire::{self, Frame};
use beamdrop_core::TransferMetadata;

use crate::link::{LinkError, LinkSession};

#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    pub receive_dir: PathBuf,
    pub read_timeout: Option<Duration>,
    /// Bound on the announced payload and on the decompressed file.
    pub max_file_bytes: u64,
}

impl From<&BeamdropConfig> for ReceiverSettings {
    fn from(config: &BeamdropConfig) -> Self {
        Self {
            receive_dir: config.transfer.receive_dir.clone(),
            read_timeout: config.link.read_timeout(),
            max_file_bytes: config.transfer.max_file_bytes,
        }
    }
}

/// A file accepted and stored.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub path: PathBuf,
    pub filename: String,
    pub bytes: usize,
    pub compressed_bytes: usize,
    pub chunk_count: u64,
    pub checksum: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("sender did not open with the expected hello")]
    HandshakeRejected,
    #[error("metadata rejected: {0}")]
    MetadataRejected(String),
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),
    #[error("frame of {len} bytes exceeds mtu {mtu}")]
    FrameTooLarge { len: usize, mtu: usize },
    #[error("{chunks} chunks of up to {chunk_len} bytes exceed the {limit} byte limit")]
    TooLarge { chunks: u64, chunk_len: usize, limit: u64 },
    #[error("sender announced {expected} chunks but sent more")]
    TooManyChunks { expected: u64 },
    #[error("expected {expected} chunks, received {received}")]
    ChunkCountMismatch { expected: u64, received: u64 },
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to store {path}: {source}")]
    Store {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub struct TransferReceiver<L: LinkSession> {
    link: L,
    settings: ReceiverSettings,
}

impl<L: LinkSession> TransferReceiver<L> {
    pub fn new(link: L, settings: ReceiverSettings) -> Self {
        Self { link, settings }
    }

    /// Serve one transfer over the link, then disconnect it.
    pub async fn run(mut self) -> Result<ReceivedFile, ReceiveError> {
        let result = self.serve().await;
        self.link.disconnect().await;

        match &result {
            Ok(file) => tracing::info!(
                peer = %self.link.peer().id,
                path = %file.path.display(),
                bytes = file.bytes,
                chunks = file.chunk_count,
                "file received"
            ),
            Err(e) => tracing::warn!(peer = %self.link.peer().id, error = %e, "receive aborted"),
        }
        result
    }

    async fn serve(&mut self) -> Result<ReceivedFile, ReceiveError> {
        let hello = self.read().await?;
        if !matches!(Frame::decode_request(&hello), Ok(Frame::ClientHello)) {
            return Err(ReceiveError::HandshakeRejected);
        }
        self.link.write_bytes(&wire::SERVER_HELLO).await?;
        let mtu = self.link.mtu()?;

        let meta = match Frame::decode_request(&self.read_frame(mtu).await?) {
            Ok(Frame::Metadata(body)) => match TransferMetadata::from_bytes(&body) {
                Ok(meta) => meta,
                Err(e) => return Err(self.reject(ReceiveError::MetadataRejected(e.to_string())).await),
            },
            other => return Err(self.reject(unexpected(other)).await),
        };
        let filename = match safe_filename(&meta.filename) {
            Some(name) => name.to_string(),
            None => {
                let reason = format!("unusable filename {:?}", meta.filename);
                return Err(self.reject(ReceiveError::MetadataRejected(reason)).await);
            }
        };
        let chunk_len = mtu.saturating_sub(wire::FRAME_OVERHEAD);
        let limit = self.settings.max_file_bytes;
        if meta.chunk_count.saturating_mul(chunk_len as u64) > limit {
            let err = ReceiveError::TooLarge {
                chunks: meta.chunk_count,
                chunk_len,
                limit,
            };
            return Err(self.reject(err).await);
        }
        self.ack().await?;
        tracing::debug!(file = %filename, chunks = meta.chunk_count, "metadata accepted");

        let mut payload = BytesMut::new();
        let mut digest = Checksum::new();
        let mut received: u64 = 0;
        loop {
            match Frame::decode_request(&self.read_frame(mtu).await?) {
                Ok(Frame::Chunk(body)) => {
                    if received >= meta.chunk_count {
                        let err = ReceiveError::TooManyChunks {
                            expected: meta.chunk_count,
                        };
                        return Err(self.reject(err).await);
                    }
                    digest.update(&body);
                    payload.extend_from_slice(&body);
                    received += 1;
                    self.ack().await?;
                    tracing::trace!(chunk = received, of = meta.chunk_count, "chunk received");
                }
                Ok(Frame::TransferComplete) => break,
                other => return Err(self.reject(unexpected(other)).await),
            }
        }

        if received != meta.chunk_count {
            let err = ReceiveError::ChunkCountMismatch {
                expected: meta.chunk_count,
                received,
            };
            return Err(self.reject(err).await);
        }

        let actual = digest.finalize();
        if !actual.eq_ignore_ascii_case(&meta.checksum) {
            let err = ReceiveError::ChecksumMismatch {
                expected: meta.checksum.clone(),
                actual,
            };
            return Err(self.reject(err).await);
        }

        let data = if payload.is_empty() {
            Vec::new()
        } else {
            match codec::decompress(&payload, limit) {
                Ok(data) => data,
                Err(e) => return Err(self.reject(e.into()).await),
            }
        };
        let path = match store(&self.settings.receive_dir, &filename, &data).await {
            Ok(path) => path,
            Err(e) => return Err(self.reject(e).await),
        };
        self.ack().await?;

        Ok(ReceivedFile {
            path,
            filename,
            bytes: data.len(),
            compressed_bytes: payload.len(),
            chunk_count: meta.chunk_count,
            checksum: actual,
        })
    }

    async fn read(&mut self) -> Result<Bytes, LinkError> {
        match self.settings.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.link.read_bytes())
                .await
                .map_err(|_| LinkError::Timeout(limit))?,
            None => self.link.read_bytes().await,
        }
    }

    /// Next frame, NAKed and refused when larger than the granted MTU.
    async fn read_frame(&mut self, mtu: usize) -> Result<Bytes, ReceiveError> {
        let frame = self.read().await?;
        if frame.len() > mtu {
            let err = ReceiveError::FrameTooLarge { len: frame.len(), mtu };
            return Err(self.reject(err).await);
        }
        Ok(frame)
    }

    async fn ack(&mut self) -> Result<(), LinkError> {
        self.link.write_bytes(&Frame::Ack.encode()).await
    }

    /// NAK the current frame and hand back `err`.
    async fn reject(&mut self, err: ReceiveError) -> ReceiveError {
        if let Err(e) = self.link.write_bytes(&Frame::Nak.encode()).await {
            tracing::debug!(error = %e, "could not send nak");
        }
        err
    }
}

fn unexpected(decoded: Result<Frame, wire::WireError>) -> ReceiveError {
    match decoded {
        Ok(frame) => ReceiveError::UnexpectedFrame(format!("{frame:?}")),
        Err(e) => ReceiveError::UnexpectedFrame(e.to_string()),
    }
}

/// The last path component of an announced filename, if it is usable.
pub fn safe_filename(announced: &str) -> Option<&str> {
    let name = announced.rsplit(['/', '\\']).next()?;
    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return None;
    }
    Some(name)
}

/// Write `data` under `dir`, never overwriting an existing file.
async fn store(dir: &Path, filename: &str, data: &[u8]) -> Result<PathBuf, ReceiveError> {
    let failed = |path: &Path, source| ReceiveError::Store {
        path: path.to_path_buf(),
        source,
    };

    tokio::fs::create_dir_all(dir).await.map_err(|e| failed(dir, e))?;

    let path = unique_path(dir, filename);
    tokio::fs::write(&path, data).await.map_err(|e| failed(&path, e))?;
    Ok(path)
}

fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let first = dir.join(filename);
    if !first.exists() {
        return first;
    }

    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(first)
}
