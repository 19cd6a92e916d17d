//! Link session — one connection to one peer, carrying whole frames.
//!
//! A LinkSession moves opaque byte buffers over a logical channel whose
//! capacity per write is the MTU. It is owned by exactly one transfer at a
//! time; its lifecycle is published on a watch channel so waiters never
//! have to poll.
//!
//! StreamLink is the session used by every radio in this workspace: it
//! frames each write as a length-prefixed SDU over any byte stream, so one
//! write on one side is exactly one read on the other.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use beamdrop_core::config::RetryPolicy;
use beamdrop_core::PeerId;

use crate::peer::{Discovery, Peer};

/// Bytes of length prefix in front of every SDU on a stream.
pub const SDU_HEADER_LEN: usize = 2;

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Idle,
    /// Radio link requested, not yet up.
    Connecting,
    /// Radio link up, logical channel requested.
    ChannelOpening,
    /// Channel open; reads and writes allowed.
    Connected,
    Closed,
}

impl LinkState {
    fn rank(self) -> Option<u8> {
        match self {
            LinkState::Idle => Some(0),
            LinkState::Connecting => Some(1),
            LinkState::ChannelOpening => Some(2),
            LinkState::Connected => Some(3),
            LinkState::Closed => None,
        }
    }

    /// True once the link has progressed at least as far as `target`.
    /// A closed link has reached nothing.
    pub fn has_reached(self, target: LinkState) -> bool {
        match (self.rank(), target.rank()) {
            (Some(have), Some(want)) => have >= want,
            _ => false,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("connection lost")]
    ConnectionLost,
    #[error("write of {len} bytes exceeds mtu {mtu}")]
    ExceedsMtu { len: usize, mtu: usize },
    #[error("zero bytes accepted by channel")]
    ZeroWrite,
    #[error("short write: {written} of {expected} bytes accepted")]
    ShortWrite { written: usize, expected: usize },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("peer {0} is not reachable by this radio")]
    UnknownPeer(PeerId),
    #[error("radio error: {0}")]
    Radio(String),
    #[error("channel i/o: {0}")]
    Io(#[from] std::io::Error),
}

// ── Traits ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait LinkSession: Send {
    fn peer(&self) -> &Peer;

    /// Subscribe to lifecycle changes. The current value is readable at once.
    fn state(&self) -> watch::Receiver<LinkState>;

    fn connected(&self) -> bool {
        *self.state().borrow() == LinkState::Connected
    }

    /// Largest buffer a single write may carry.
    fn mtu(&self) -> Result<usize, LinkError>;

    /// Next buffer the peer wrote. Empty reads are reported as a lost link.
    async fn read_bytes(&mut self) -> Result<Bytes, LinkError>;

    /// Write one buffer, all or nothing.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError>;

    /// Tear the channel and radio link down. Idempotent.
    async fn disconnect(&mut self);
}

/// A radio able to find peers and open links to them.
pub trait Radio: Send + Sync + 'static {
    type Link: LinkSession + 'static;

    /// Start reporting sightings of `service` to `discovery`.
    fn start_scan(&self, service: &str, discovery: Arc<Discovery>) -> Result<(), LinkError>;

    /// Begin connecting to `peer` and open `channel` once the link is up.
    ///
    /// Returns immediately; progress is observable through the link state.
    fn connect(&self, peer: &Peer, channel: u16) -> Result<Self::Link, LinkError>;
}

// ── Waiting ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// Every attempt elapsed before the target state.
    Exhausted,
    /// The link closed while waiting.
    Closed,
}

/// Wait for the link to reach `target`, giving up after the policy's
/// attempts. Each attempt waits on the state channel for at most
/// `policy.delay(attempt)`.
pub async fn wait_for_state(
    rx: &mut watch::Receiver<LinkState>,
    policy: &RetryPolicy,
    target: LinkState,
) -> Result<(), WaitError> {
    if rx.borrow_and_update().has_reached(target) {
        return Ok(());
    }

    for attempt in 0..policy.attempts {
        let delay = policy.delay(attempt);
        let waited = tokio::time::timeout(
            delay,
            rx.wait_for(|s| s.has_reached(target) || *s == LinkState::Closed),
        )
        .await
        .map(|r| r.map(|state| *state));

        match waited {
            Ok(Ok(state)) => {
                return if state == LinkState::Closed {
                    Err(WaitError::Closed)
                } else {
                    Ok(())
                };
            }
            Ok(Err(_)) => return Err(WaitError::Closed),
            Err(_) => {
                tracing::debug!(
                    attempt = attempt + 1,
                    of = policy.attempts,
                    target = ?target,
                    "still waiting for link"
                );
            }
        }
    }

    Err(WaitError::Exhausted)
}

// ── Stream-backed session ─────────────────────────────────────────────────────

type Reader = Box<dyn AsyncRead + Send + Unpin>;
type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// The two halves of an open channel plus its negotiated MTU.
pub struct ChannelIo {
    reader: Reader,
    writer: Writer,
    mtu: usize,
}

impl ChannelIo {
    pub fn new<R, W>(reader: R, writer: W, mtu: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            mtu,
        }
    }

    pub fn split<S>(stream: S, mtu: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, mtu)
    }
}

/// Handed to the radio's connection task; drives the link through its
/// states and delivers the channel when it opens.
pub struct ChannelOpener {
    state: Arc<watch::Sender<LinkState>>,
    mtu: Arc<AtomicUsize>,
    io_tx: oneshot::Sender<ChannelIo>,
}

impl ChannelOpener {
    /// Radio link is up; the channel is being requested.
    pub fn link_up(&self) {
        self.state.send_if_modified(|s| {
            if *s == LinkState::Connecting {
                *s = LinkState::ChannelOpening;
                true
            } else {
                false
            }
        });
    }

    /// Channel is open. A link closed in the meantime discards `io`.
    pub fn open(self, io: ChannelIo) {
        if *self.state.borrow() == LinkState::Closed {
            return;
        }
        self.mtu.store(io.mtu, Ordering::Release);
        if self.io_tx.send(io).is_err() {
            return;
        }
        self.state.send_if_modified(|s| {
            if *s == LinkState::Closed {
                false
            } else {
                *s = LinkState::Connected;
                true
            }
        });
    }

    pub fn fail(self, reason: &str) {
        tracing::debug!(reason, "link could not be established");
        self.state.send_replace(LinkState::Closed);
    }
}

pub struct StreamLink {
    peer: Peer,
    state: Arc<watch::Sender<LinkState>>,
    mtu: Arc<AtomicUsize>,
    io: Option<ChannelIo>,
    pending: Option<oneshot::Receiver<ChannelIo>>,
    task: Option<JoinHandle<()>>,
}

impl StreamLink {
    /// A link still being brought up. The returned opener finishes it.
    pub fn pending(peer: Peer) -> (Self, ChannelOpener) {
        let state = Arc::new(watch::channel(LinkState::Connecting).0);
        let mtu = Arc::new(AtomicUsize::new(0));
        let (io_tx, io_rx) = oneshot::channel();

        let opener = ChannelOpener {
            state: Arc::clone(&state),
            mtu: Arc::clone(&mtu),
            io_tx,
        };
        let link = Self {
            peer,
            state,
            mtu,
            io: None,
            pending: Some(io_rx),
            task: None,
        };
        (link, opener)
    }

    /// A link over an already open channel, as seen by the accepting side.
    pub fn established(peer: Peer, io: ChannelIo) -> Self {
        let state = Arc::new(watch::channel(LinkState::Connected).0);
        let mtu = Arc::new(AtomicUsize::new(io.mtu));
        Self {
            peer,
            state,
            mtu,
            io: Some(io),
            pending: None,
            task: None,
        }
    }

    /// Tie the radio's connection task to this link; disconnect aborts it.
    pub fn attach_task(&mut self, task: JoinHandle<()>) {
        self.task = Some(task);
    }

    fn io(&mut self) -> Result<&mut ChannelIo, LinkError> {
        if *self.state.borrow() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        if self.io.is_none() {
            if let Some(Ok(io)) = self.pending.as_mut().map(|rx| rx.try_recv()) {
                self.io = Some(io);
                self.pending = None;
            }
        }
        self.io.as_mut().ok_or(LinkError::NotConnected)
    }

    fn mark_lost(&mut self) {
        tracing::debug!(peer = %self.peer.id, "channel closed by peer");
        self.state.send_replace(LinkState::Closed);
    }
}

async fn read_sdu(reader: &mut Reader) -> Result<Bytes, LinkError> {
    let mut header = [0u8; SDU_HEADER_LEN];
    reader.read_exact(&mut header).await.map_err(eof_is_lost)?;

    let len = u16::from_be_bytes(header) as usize;
    if len == 0 {
        return Err(LinkError::ConnectionLost);
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(eof_is_lost)?;
    Ok(Bytes::from(buf))
}

fn eof_is_lost(e: std::io::Error) -> LinkError {
    match e.kind() {
        std::io::ErrorKind::UnexpectedEof
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::BrokenPipe => LinkError::ConnectionLost,
        _ => LinkError::Io(e),
    }
}

#[async_trait]
impl LinkSession for StreamLink {
    fn peer(&self) -> &Peer {
        &self.peer
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    fn mtu(&self) -> Result<usize, LinkError> {
        if *self.state.borrow() != LinkState::Connected {
            return Err(LinkError::NotConnected);
        }
        match self.mtu.load(Ordering::Acquire) {
            0 => Err(LinkError::NotConnected),
            mtu => Ok(mtu),
        }
    }

    async fn read_bytes(&mut self) -> Result<Bytes, LinkError> {
        let result = read_sdu(&mut self.io()?.reader).await;
        if matches!(result, Err(LinkError::ConnectionLost)) {
            self.mark_lost();
        }
        result
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        let io = self.io()?;
        if bytes.is_empty() {
            return Err(LinkError::ZeroWrite);
        }
        if bytes.len() > io.mtu || bytes.len() > u16::MAX as usize {
            return Err(LinkError::ExceedsMtu {
                len: bytes.len(),
                mtu: io.mtu,
            });
        }

        let mut sdu = Vec::with_capacity(SDU_HEADER_LEN + bytes.len());
        sdu.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        sdu.extend_from_slice(bytes);

        let written = match io.writer.write(&sdu).await {
            Ok(n) => n,
            Err(e) => {
                let err = eof_is_lost(e);
                if matches!(err, LinkError::ConnectionLost) {
                    self.mark_lost();
                }
                return Err(err);
            }
        };
        if written == 0 {
            return Err(LinkError::ZeroWrite);
        }
        if written < sdu.len() {
            return Err(LinkError::ShortWrite {
                written: written.saturating_sub(SDU_HEADER_LEN),
                expected: bytes.len(),
            });
        }
        io.writer.flush().await?;
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.pending = None;
        if let Some(mut io) = self.io.take() {
            let _ = io.writer.shutdown().await;
        }
        let previous = self.state.send_replace(LinkState::Closed);
        if previous != LinkState::Closed {
            tracing::debug!(peer = %self.peer.id, "link closed");
        }
    }
}
