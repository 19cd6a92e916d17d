//! beamdrop integration test harness.
//!
//! Every test runs in-process over the loopback radio: a coordinator on
//! the sending side, and on the far end either a real TransferReceiver
//! or a scripted responder that records every frame it is sent.
//!
//!   cargo test --test integration

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use beamdrop_core::codec;
use beamdrop_core::config::RetryPolicy;
use beamdrop_core::wire;
use beamdrop_core::{PeerId, TransferMetadata};
use beamdrop_services::engine::EngineSettings;
use beamdrop_services::loopback::LoopbackRadio;
use beamdrop_services::receiver::ReceiverSettings;
use beamdrop_services::{
    Discovery, LinkSession, Outcome, Peer, StreamLink, TransferCoordinator, TransferEvent, TransferHandle,
    TransferState,
};

mod discovery;
mod transfer;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const LEVEL: u32 = 6;

pub fn settings() -> EngineSettings {
    EngineSettings {
        retry: RetryPolicy {
            attempts: 5,
            interval: Duration::from_millis(20),
            backoff: 1,
            max_interval: Duration::from_millis(20),
        },
        settle: Duration::ZERO,
        read_timeout: Some(Duration::from_secs(2)),
        headroom: 0,
        compression_level: LEVEL,
    }
}

pub fn receiver_settings(dir: &Path) -> ReceiverSettings {
    ReceiverSettings {
        receive_dir: dir.to_path_buf(),
        read_timeout: Some(Duration::from_secs(2)),
        max_file_bytes: 1 << 20,
    }
}

pub fn device(n: u8) -> Peer {
    Peer::new(PeerId([n; 16]), Some(format!("device-{n}")))
}

/// Loopback radio, discovery and coordinator wired together. Register
/// devices on `radio`, then `scan()` to make them selectable.
pub struct Bench {
    pub radio: Arc<LoopbackRadio>,
    pub discovery: Arc<Discovery>,
    pub coordinator: TransferCoordinator<LoopbackRadio>,
}

impl Bench {
    pub fn new() -> Self {
        Self::with_settings(settings())
    }

    pub fn with_settings(settings: EngineSettings) -> Self {
        let radio = Arc::new(LoopbackRadio::new());
        let discovery = Arc::new(Discovery::with_limits(wire::SERVICE_UUID, Duration::from_secs(60), 16));
        let coordinator =
            TransferCoordinator::with_settings(Arc::clone(&radio), Arc::clone(&discovery), settings, wire::CHANNEL_PSM);
        Self {
            radio,
            discovery,
            coordinator,
        }
    }

    pub fn scan(&self) {
        self.discovery.start(&*self.radio).unwrap();
    }
}

/// Deterministic bytes zlib cannot shrink.
pub fn noise(len: usize, seed: u64) -> Vec<u8> {
    let mut x = seed | 1;
    (0..len)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            x as u8
        })
        .collect()
}

/// The first noise payload of at least `start` bytes whose compressed size
/// satisfies `accept`. Returns the payload and its compressed size.
pub fn payload_where(start: usize, accept: impl Fn(usize) -> bool) -> (Vec<u8>, usize) {
    for n in start..start + 4096 {
        let data = noise(n, n as u64);
        let compressed = codec::compress(&data, LEVEL).unwrap().len();
        if accept(compressed) {
            return (data, compressed);
        }
    }
    panic!("no payload satisfies the size constraint");
}

pub fn bytes_source(data: &[u8]) -> beamdrop_services::TransferSource {
    beamdrop_services::TransferSource::Bytes {
        filename: "payload.bin".into(),
        data: Bytes::copy_from_slice(data),
    }
}

/// Every event a transfer published, ending with its outcome.
pub struct Finished {
    pub events: Vec<TransferEvent>,
    pub outcome: Outcome,
}

impl Finished {
    pub fn progress(&self) -> Vec<(usize, usize)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { sent, total } => Some((*sent, *total)),
                _ => None,
            })
            .collect()
    }

    pub fn reached(&self, state: TransferState) -> bool {
        self.events
            .iter()
            .any(|e| matches!(e, TransferEvent::State(s) if *s == state))
    }

    /// SendEnabled(true) came before Finished, and Finished came last.
    pub fn re_enabled_before_finish(&self) -> bool {
        let enabled = self
            .events
            .iter()
            .position(|e| matches!(e, TransferEvent::SendEnabled(true)));
        let finished = self
            .events
            .iter()
            .position(|e| matches!(e, TransferEvent::Finished(_)));
        matches!((enabled, finished), (Some(a), Some(b)) if a < b && b == self.events.len() - 1)
    }
}

pub async fn drain(mut handle: TransferHandle) -> Finished {
    let mut events = Vec::new();
    let collect = async {
        while let Some(e) = handle.next_event().await {
            events.push(e);
        }
    };
    tokio::time::timeout(Duration::from_secs(10), collect)
        .await
        .expect("transfer did not finish");

    let outcome = events
        .iter()
        .rev()
        .find_map(|e| match e {
            TransferEvent::Finished(o) => Some(o.clone()),
            _ => None,
        })
        .expect("no Finished event");
    Finished { events, outcome }
}

// ── Scripted responder ────────────────────────────────────────────────────────

/// Frames seen by a scripted responder.
#[derive(Default)]
pub struct Recording {
    pub frames: Vec<Bytes>,
    /// The sender closed the link.
    pub closed: bool,
}

impl Recording {
    pub fn chunk_bodies(&self) -> Vec<Bytes> {
        self.frames
            .iter()
            .filter(|f| f.first() == Some(&wire::TAG_CHUNK))
            .map(|f| f.slice(1..))
            .collect()
    }

    pub fn metadata(&self) -> TransferMetadata {
        let frame = self
            .frames
            .iter()
            .find(|f| f.first() == Some(&wire::TAG_METADATA))
            .expect("no metadata frame");
        TransferMetadata::from_bytes(&frame[1..]).unwrap()
    }

    pub fn tags(&self) -> Vec<u8> {
        self.frames.iter().filter_map(|f| f.first().copied()).collect()
    }
}

/// Answer like a receiver would, except chunk `n` (1-based) gets
/// `reply_to_chunk(n)`. Runs until the sender closes the link.
pub async fn respond(mut link: StreamLink, reply_to_chunk: impl Fn(usize) -> Vec<u8>) -> Recording {
    let mut recording = Recording::default();
    let mut chunks = 0;

    loop {
        let frame = match link.read_bytes().await {
            Ok(f) => f,
            Err(_) => {
                recording.closed = true;
                break;
            }
        };
        recording.frames.push(frame.clone());

        let reply = match frame.first() {
            Some(&wire::TAG_CLIENT_HELLO) => wire::SERVER_HELLO.to_vec(),
            Some(&wire::TAG_CHUNK) => {
                chunks += 1;
                reply_to_chunk(chunks)
            }
            _ => vec![wire::ACK],
        };
        if link.write_bytes(&reply).await.is_err() {
            recording.closed = true;
            break;
        }
    }

    link.disconnect().await;
    recording
}

/// Register `peer` with a responder acking everything.
pub fn honest_responder(bench: &Bench, peer: Peer, mtu: usize) -> tokio::task::JoinHandle<Recording> {
    scripted_responder(bench, peer, mtu, |_| vec![wire::ACK])
}

pub fn scripted_responder(
    bench: &Bench,
    peer: Peer,
    mtu: usize,
    reply_to_chunk: impl Fn(usize) -> Vec<u8> + Send + 'static,
) -> tokio::task::JoinHandle<Recording> {
    let mut incoming = bench.radio.add_device(peer, mtu);
    tokio::spawn(async move {
        let link = incoming.recv().await.expect("no connection");
        respond(link, reply_to_chunk).await
    })
}
