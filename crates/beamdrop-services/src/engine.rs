//! Transfer protocol engine — the sending side of one file transfer.
//!
//! Drives a LinkSession through handshake, metadata, chunk and completion
//! exchanges with strict stop-and-wait: every frame written waits for its
//! one-byte acknowledgment before the next one goes out. Each state change
//! and each acknowledged chunk is published as a TransferEvent.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

use beamdrop_core::chunk::ChunkError;
use beamdrop_core::codec::{self, CodecError};
use beamdrop_core::config::{BeamdropConfig, RetryPolicy};
use beamdrop_core::wire::{self, Frame};
use beamdrop_core::{ChunkPlan, PeerId, TransferMetadata};

use crate::link::{wait_for_state, LinkError, LinkSession, LinkState, WaitError};
use crate::peer::Peer;

// ── State & events ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Idle,
    Connecting,
    AwaitingHandshake,
    AwaitingMetadataAck,
    SendingChunks,
    AwaitingCompleteAck,
    Done,
    Aborted(AbortReason),
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferState::Done | TransferState::Aborted(_))
    }
}

/// Why a transfer ended in `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ConnectTimeout,
    ChannelTimeout,
    Link,
    HandshakeRejected,
    MetadataRejected,
    ChunkRejected { chunk: usize, of: usize },
    CompletionRejected,
    Codec,
    Serialization,
    SourceRead,
    Busy,
    UnknownPeer,
    Interrupted,
}

#[derive(Debug, Clone)]
pub enum TransferEvent {
    State(TransferState),
    /// Chunks acknowledged so far.
    Progress { sent: usize, total: usize },
    /// Whether a new transfer may be started.
    SendEnabled(bool),
    Finished(Outcome),
}

/// Terminal success record.
#[derive(Debug, Clone)]
pub struct TransferReport {
    pub peer: Peer,
    pub filename: String,
    pub original_bytes: usize,
    pub compressed_bytes: usize,
    pub chunk_count: usize,
    pub checksum: String,
    pub elapsed: Duration,
}

/// Terminal outcome as seen by whoever renders the transfer.
#[derive(Debug, Clone)]
pub enum Outcome {
    Sent(TransferReport),
    Failed { reason: AbortReason, message: String },
}

impl Outcome {
    pub fn from_result(result: &Result<TransferReport, TransferError>) -> Self {
        match result {
            Ok(report) => Outcome::Sent(report.clone()),
            Err(e) => Outcome::Failed {
                reason: e.reason(),
                message: e.user_message(),
            },
        }
    }

    /// One line for the user, success or failure alike.
    pub fn message(&self) -> String {
        match self {
            Outcome::Sent(_) => "File sent successfully!".to_string(),
            Outcome::Failed { message, .. } => message.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Sent(_))
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("peer did not connect within {0:?}")]
    ConnectTimeout(Duration),
    #[error("channel did not open within {0:?}")]
    ChannelTimeout(Duration),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("handshake rejected ({len}-byte response)")]
    HandshakeRejected { len: usize },
    #[error("metadata rejected")]
    MetadataRejected,
    #[error("chunk {chunk} of {of} rejected")]
    ChunkRejected { chunk: usize, of: usize },
    #[error("transfer completion rejected")]
    CompletionRejected,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("metadata encoding failed: {0}")]
    Serialization(String),
    #[error("failed to read {path}: {source}")]
    SourceRead {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("a transfer is already in progress")]
    Busy,
    #[error("peer {0} has not been discovered")]
    UnknownPeer(PeerId),
    #[error("transfer task failed: {0}")]
    Interrupted(String),
}

impl From<ChunkError> for TransferError {
    fn from(e: ChunkError) -> Self {
        TransferError::Serialization(e.to_string())
    }
}

impl TransferError {
    pub fn reason(&self) -> AbortReason {
        match self {
            TransferError::ConnectTimeout(_) => AbortReason::ConnectTimeout,
            TransferError::ChannelTimeout(_) => AbortReason::ChannelTimeout,
            TransferError::Link(_) => AbortReason::Link,
            TransferError::HandshakeRejected { .. } => AbortReason::HandshakeRejected,
            TransferError::MetadataRejected => AbortReason::MetadataRejected,
            TransferError::ChunkRejected { chunk, of } => AbortReason::ChunkRejected {
                chunk: *chunk,
                of: *of,
            },
            TransferError::CompletionRejected => AbortReason::CompletionRejected,
            TransferError::Codec(_) => AbortReason::Codec,
            TransferError::Serialization(_) => AbortReason::Serialization,
            TransferError::SourceRead { .. } => AbortReason::SourceRead,
            TransferError::Busy => AbortReason::Busy,
            TransferError::UnknownPeer(_) => AbortReason::UnknownPeer,
            TransferError::Interrupted(_) => AbortReason::Interrupted,
        }
    }

    /// Message suitable for an alert.
    pub fn user_message(&self) -> String {
        match self {
            TransferError::ConnectTimeout(budget) => {
                format!("Unable to connect after {}.", human(*budget))
            }
            TransferError::ChannelTimeout(budget) => {
                format!("Unable to open the transfer channel after {}.", human(*budget))
            }
            TransferError::Link(LinkError::Timeout(_)) => {
                "Transfer failed: the other device stopped responding.".to_string()
            }
            TransferError::Link(_) => "Transfer failed: the connection was lost.".to_string(),
            TransferError::HandshakeRejected { .. } => "Handshake failed.".to_string(),
            TransferError::MetadataRejected => "Did not receive metadata acknowledgment.".to_string(),
            TransferError::ChunkRejected { .. } | TransferError::CompletionRejected => {
                "Transfer failed: unexpected server response.".to_string()
            }
            TransferError::Codec(_) => "Unable to compress data before sending.".to_string(),
            TransferError::Serialization(_) => "Unable to encode file metadata.".to_string(),
            TransferError::SourceRead { .. } => "Unable to open file.".to_string(),
            TransferError::Busy => "A transfer is already in progress.".to_string(),
            TransferError::UnknownPeer(_) => "Selected device is no longer available.".to_string(),
            TransferError::Interrupted(_) => "Transfer failed unexpectedly.".to_string(),
        }
    }
}

fn human(d: Duration) -> String {
    if d.subsec_millis() == 0 && d.as_secs() > 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

// ── Payload ───────────────────────────────────────────────────────────────────

/// Where the bytes to send come from.
#[derive(Debug, Clone)]
pub enum TransferSource {
    Path(PathBuf),
    Bytes { filename: String, data: Bytes },
}

impl TransferSource {
    pub fn filename(&self) -> String {
        match self {
            TransferSource::Path(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "untitled".to_string()),
            TransferSource::Bytes { filename, .. } => filename.clone(),
        }
    }

    /// Cheap check that the source can be read, before any link is opened.
    pub fn check_readable(&self) -> Result<(), TransferError> {
        let TransferSource::Path(path) = self else {
            return Ok(());
        };
        let meta = std::fs::metadata(path).map_err(|source| TransferError::SourceRead {
            path: path.clone(),
            source,
        })?;
        if !meta.is_file() {
            return Err(TransferError::SourceRead {
                path: path.clone(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }
        Ok(())
    }
}

/// The compressed payload and its checksum, ready to chunk.
#[derive(Debug, Clone)]
pub struct PreparedPayload {
    pub filename: String,
    pub original_len: usize,
    pub compressed: Bytes,
    pub checksum: String,
}

impl PreparedPayload {
    /// Read, compress and checksum. Blocking: run off the async workers.
    pub fn prepare(source: TransferSource, level: u32) -> Result<Self, TransferError> {
        let filename = source.filename();
        let data = match source {
            TransferSource::Path(path) => {
                Bytes::from(std::fs::read(&path).map_err(|source| TransferError::SourceRead {
                    path,
                    source,
                })?)
            }
            TransferSource::Bytes { data, .. } => data,
        };

        // An empty file crosses the link as an empty payload with no chunks.
        let compressed = if data.is_empty() {
            Vec::new()
        } else {
            codec::compress(&data, level)?
        };
        let checksum = codec::checksum(&compressed);
        Ok(Self {
            filename,
            original_len: data.len(),
            compressed: Bytes::from(compressed),
            checksum,
        })
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub retry: RetryPolicy,
    pub settle: Duration,
    pub read_timeout: Option<Duration>,
    pub headroom: usize,
    pub compression_level: u32,
}

impl From<&BeamdropConfig> for EngineSettings {
    fn from(config: &BeamdropConfig) -> Self {
        Self {
            retry: config.link.retry_policy(),
            settle: config.link.settle(),
            read_timeout: config.link.read_timeout(),
            headroom: config.link.write_headroom,
            compression_level: config.transfer.compression_level,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from(&BeamdropConfig::default())
    }
}

pub struct TransferEngine<L: LinkSession> {
    link: L,
    settings: EngineSettings,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl<L: LinkSession> TransferEngine<L> {
    pub fn new(link: L, settings: EngineSettings, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        Self {
            link,
            settings,
            events,
        }
    }

    /// Run the transfer to completion. The link is disconnected before this
    /// returns, whatever the outcome.
    pub async fn run(mut self, source: TransferSource) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        self.set_state(TransferState::Connecting);

        let result = self.drive(source, started).await;
        self.link.disconnect().await;

        match &result {
            Ok(report) => {
                tracing::info!(
                    peer = %report.peer.id,
                    file = %report.filename,
                    bytes = report.original_bytes,
                    chunks = report.chunk_count,
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    "transfer complete"
                );
                self.set_state(TransferState::Done);
            }
            Err(e) => {
                tracing::warn!(peer = %self.link.peer().id, error = %e, "transfer aborted");
                self.set_state(TransferState::Aborted(e.reason()));
            }
        }
        result
    }

    async fn drive(&mut self, source: TransferSource, started: Instant) -> Result<TransferReport, TransferError> {
        let level = self.settings.compression_level;
        let payload = tokio::task::spawn_blocking(move || PreparedPayload::prepare(source, level))
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))??;

        tracing::debug!(
            file = %payload.filename,
            original = payload.original_len,
            compressed = payload.compressed.len(),
            "payload prepared"
        );

        self.await_channel().await?;

        // Handshake.
        self.set_state(TransferState::AwaitingHandshake);
        self.link.write_bytes(&wire::CLIENT_HELLO).await?;
        let reply = self.read_response().await?;
        if !wire::is_server_hello(&reply) {
            return Err(TransferError::HandshakeRejected { len: reply.len() });
        }

        let mtu = self.link.mtu()?;
        let plan = ChunkPlan::new(payload.compressed.len(), mtu, self.settings.headroom)?;
        tracing::debug!(
            chunks = plan.chunk_count,
            chunk_len = plan.chunk_length,
            last_len = plan.last_chunk_len(),
            "chunk plan"
        );
        let metadata = TransferMetadata::new(&payload.filename, &payload.checksum, plan.chunk_count as u64);
        let body = metadata
            .to_bytes()
            .map_err(|e| TransferError::Serialization(e.to_string()))?;
        let frame = Frame::Metadata(Bytes::from(body));
        if frame.encoded_len() > mtu {
            return Err(TransferError::Serialization(format!(
                "metadata frame of {} bytes exceeds mtu {mtu}",
                frame.encoded_len()
            )));
        }

        // Metadata.
        self.set_state(TransferState::AwaitingMetadataAck);
        self.link.write_bytes(&frame.encode()).await?;
        if !self.acked().await? {
            return Err(TransferError::MetadataRejected);
        }

        // Chunks.
        self.set_state(TransferState::SendingChunks);
        let total = plan.chunk_count;
        for (i, chunk) in plan.chunks(&payload.compressed).enumerate() {
            let frame = Frame::Chunk(payload.compressed.slice_ref(chunk));
            self.link.write_bytes(&frame.encode()).await?;
            if !self.acked().await? {
                return Err(TransferError::ChunkRejected { chunk: i + 1, of: total });
            }
            tracing::trace!(chunk = i + 1, of = total, len = chunk.len(), "chunk acknowledged");
            self.emit(TransferEvent::Progress { sent: i + 1, total });
        }

        // Completion.
        self.set_state(TransferState::AwaitingCompleteAck);
        self.link.write_bytes(&Frame::TransferComplete.encode()).await?;
        if !self.acked().await? {
            return Err(TransferError::CompletionRejected);
        }

        Ok(TransferReport {
            peer: self.link.peer().clone(),
            filename: payload.filename,
            original_bytes: payload.original_len,
            compressed_bytes: payload.compressed.len(),
            chunk_count: total,
            checksum: payload.checksum,
            elapsed: started.elapsed(),
        })
    }

    /// Wait for the radio link, then the channel, then settle.
    async fn await_channel(&mut self) -> Result<(), TransferError> {
        let policy = self.settings.retry;
        let mut state = self.link.state();

        wait_for_state(&mut state, &policy, LinkState::ChannelOpening)
            .await
            .map_err(|e| match e {
                WaitError::Exhausted => TransferError::ConnectTimeout(policy.budget()),
                WaitError::Closed => TransferError::Link(LinkError::ConnectionLost),
            })?;
        tracing::debug!(peer = %self.link.peer().id, "radio link up");

        wait_for_state(&mut state, &policy, LinkState::Connected)
            .await
            .map_err(|e| match e {
                WaitError::Exhausted => TransferError::ChannelTimeout(policy.budget()),
                WaitError::Closed => TransferError::Link(LinkError::ConnectionLost),
            })?;
        tracing::debug!(peer = %self.link.peer().id, "channel open");

        if !self.settings.settle.is_zero() {
            tokio::time::sleep(self.settings.settle).await;
        }
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Bytes, LinkError> {
        match self.settings.read_timeout {
            Some(limit) => tokio::time::timeout(limit, self.link.read_bytes())
                .await
                .map_err(|_| LinkError::Timeout(limit))?,
            None => self.link.read_bytes().await,
        }
    }

    async fn acked(&mut self) -> Result<bool, LinkError> {
        let response = self.read_response().await?;
        if !wire::is_ack(&response) {
            tracing::debug!(response = %hex::encode(&response), "negative or malformed acknowledgment");
            return Ok(false);
        }
        Ok(true)
    }

    fn set_state(&mut self, state: TransferState) {
        tracing::debug!(state = ?state, "transfer state");
        self.emit(TransferEvent::State(state));
    }

    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }
}
