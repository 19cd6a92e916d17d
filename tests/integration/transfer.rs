//! Sender against a scripted responder or a real receiver.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::watch;

use beamdrop_core::codec;
use beamdrop_core::wire;
use beamdrop_services::engine::AbortReason;
use beamdrop_services::{
    LinkError, LinkSession, LinkState, Outcome, Peer, ReceiveError, StreamLink, TransferReceiver, TransferSource,
    TransferState,
};

use crate::{
    bytes_source, device, drain, honest_responder, payload_where, receiver_settings, scripted_responder, settings,
    Bench, Recording, LEVEL,
};

async fn recording(task: tokio::task::JoinHandle<Recording>) -> Recording {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("responder did not finish")
        .expect("responder panicked")
}

fn failure(outcome: &Outcome) -> AbortReason {
    match outcome {
        Outcome::Failed { reason, .. } => *reason,
        Outcome::Sent(_) => panic!("transfer unexpectedly succeeded"),
    }
}

// ── Chunking ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_byte_file_sends_no_chunks() {
    let bench = Bench::new();
    let peer = device(1);
    let responder = honest_responder(&bench, peer.clone(), 185);
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"")).unwrap();
    let finished = drain(handle).await;
    let rec = recording(responder).await;

    assert!(finished.outcome.is_success(), "{}", finished.outcome.message());
    assert_eq!(rec.metadata().chunk_count, 0);
    assert!(rec.chunk_bodies().is_empty());
    assert_eq!(
        rec.tags(),
        vec![wire::TAG_CLIENT_HELLO, wire::TAG_METADATA, wire::TAG_TRANSFER_COMPLETE]
    );
    assert!(finished.progress().is_empty());
    assert!(rec.closed);
}

#[tokio::test]
async fn exact_multiple_has_no_remainder_chunk() {
    let (data, compressed) = payload_where(600, |c| c % 4 == 0 && c / 4 >= 150);
    let chunk_len = compressed / 4;

    let bench = Bench::new();
    let peer = device(2);
    let responder = honest_responder(&bench, peer.clone(), chunk_len + wire::FRAME_OVERHEAD);
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(&data)).unwrap();
    let finished = drain(handle).await;
    let rec = recording(responder).await;

    assert!(finished.outcome.is_success(), "{}", finished.outcome.message());
    let chunks = rec.chunk_bodies();
    assert_eq!(chunks.len(), 4);
    assert!(chunks.iter().all(|c| c.len() == chunk_len));
    assert_eq!(rec.metadata().chunk_count, 4);
    assert_eq!(finished.progress(), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[tokio::test]
async fn remainder_lands_in_short_final_chunk() {
    let (data, compressed) = payload_where(620, |c| c > 600 && c < 800 && c % 200 != 0);

    let bench = Bench::new();
    let peer = device(3);
    let responder = honest_responder(&bench, peer.clone(), 201);
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(&data)).unwrap();
    let finished = drain(handle).await;
    let rec = recording(responder).await;

    assert!(finished.outcome.is_success(), "{}", finished.outcome.message());
    let chunks = rec.chunk_bodies();
    assert_eq!(chunks.len(), 4);
    assert!(chunks[..3].iter().all(|c| c.len() == 200));
    assert_eq!(chunks[3].len(), compressed % 200);

    let mut joined = BytesMut::new();
    for c in &chunks {
        joined.extend_from_slice(c);
    }
    let expected = codec::compress(&data, LEVEL).unwrap();
    assert_eq!(&joined[..], &expected[..]);
    assert_eq!(rec.metadata().checksum, codec::checksum(&expected));
}

#[tokio::test]
async fn headroom_shrinks_chunks() {
    let (data, compressed) = payload_where(400, |c| c > 300 && c % 150 != 0);

    let mut tight = settings();
    tight.headroom = 50;
    let bench = Bench::with_settings(tight);
    let peer = device(4);
    let responder = honest_responder(&bench, peer.clone(), 201);
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(&data)).unwrap();
    let finished = drain(handle).await;
    let rec = recording(responder).await;

    assert!(finished.outcome.is_success(), "{}", finished.outcome.message());
    let chunks = rec.chunk_bodies();
    assert_eq!(chunks.len(), compressed.div_ceil(150));
    assert!(chunks.iter().all(|c| c.len() <= 150));
}

// ── Failures ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn unreachable_peer_is_connect_timeout() {
    let bench = Bench::new();
    let peer = device(5);
    bench.radio.add_unreachable(peer.clone());
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"hello")).unwrap();
    let finished = drain(handle).await;

    assert_eq!(failure(&finished.outcome), AbortReason::ConnectTimeout);
    assert_eq!(finished.outcome.message(), "Unable to connect after 100ms.");
    assert!(!finished.reached(TransferState::AwaitingHandshake));
    assert!(finished.re_enabled_before_finish());
    assert!(bench.coordinator.can_send());
}

#[tokio::test]
async fn channel_that_never_opens_is_channel_timeout() {
    let bench = Bench::new();
    let peer = device(6);
    bench.radio.add_without_channel(peer.clone());
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"hello")).unwrap();
    let finished = drain(handle).await;

    assert_eq!(failure(&finished.outcome), AbortReason::ChannelTimeout);
    assert!(!finished.reached(TransferState::AwaitingHandshake));
}

#[tokio::test]
async fn wrong_length_ack_after_third_chunk() {
    let (data, _) = payload_where(820, |c| c > 800 && c <= 1000);

    let bench = Bench::new();
    let peer = device(7);
    let responder = scripted_responder(&bench, peer.clone(), 201, |n| {
        if n == 3 {
            vec![wire::ACK, wire::ACK]
        } else {
            vec![wire::ACK]
        }
    });
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(&data)).unwrap();
    let finished = drain(handle).await;
    let rec = recording(responder).await;

    assert_eq!(failure(&finished.outcome), AbortReason::ChunkRejected { chunk: 3, of: 5 });
    assert_eq!(rec.chunk_bodies().len(), 3);
    assert_eq!(rec.metadata().chunk_count, 5);
    assert!(!rec.tags().contains(&wire::TAG_TRANSFER_COMPLETE));
    assert!(rec.closed);
    assert_eq!(finished.progress(), vec![(1, 5), (2, 5)]);
    assert!(finished.reached(TransferState::Aborted(AbortReason::ChunkRejected { chunk: 3, of: 5 })));
}

#[tokio::test]
async fn bad_server_hello_aborts_before_metadata() {
    let bench = Bench::new();
    let peer = device(8);
    let mut incoming = bench.radio.add_device(peer.clone(), 185);
    let responder = tokio::spawn(async move {
        let mut link = incoming.recv().await.unwrap();
        let hello = link.read_bytes().await.unwrap();
        link.write_bytes(&[wire::ACK]).await.unwrap();
        let after = link.read_bytes().await;
        (hello, after.is_err())
    });
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"hi")).unwrap();
    let finished = drain(handle).await;
    let (hello, lost) = responder.await.unwrap();

    assert_eq!(failure(&finished.outcome), AbortReason::HandshakeRejected);
    assert_eq!(&hello[..], &wire::CLIENT_HELLO[..]);
    assert!(lost, "sender should close without sending metadata");
}

#[tokio::test]
async fn silent_peer_times_out() {
    let mut quick = settings();
    quick.read_timeout = Some(Duration::from_millis(100));
    let bench = Bench::with_settings(quick);
    let peer = device(9);
    let mut incoming = bench.radio.add_device(peer.clone(), 185);
    let responder = tokio::spawn(async move {
        let mut link = incoming.recv().await.unwrap();
        let _hello = link.read_bytes().await.unwrap();
        // Never answer; wait for the sender to give up.
        link.read_bytes().await.is_err()
    });
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"hi")).unwrap();
    let finished = drain(handle).await;

    assert_eq!(failure(&finished.outcome), AbortReason::Link);
    assert!(responder.await.unwrap());
}

// ── End to end ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn file_round_trips_through_receiver() {
    let inbox = tempfile::tempdir().unwrap();
    let outbox = tempfile::tempdir().unwrap();
    let source = outbox.path().join("notes.txt");
    let content = "the quick brown fox jumps over the lazy dog\n".repeat(200);
    std::fs::write(&source, &content).unwrap();

    let bench = Bench::new();
    let peer = device(10);
    let mut received = bench.radio.add_receiver(peer.clone(), 185, receiver_settings(inbox.path()));
    bench.scan();

    let handle = bench
        .coordinator
        .begin_transfer(&peer.id, TransferSource::Path(source))
        .unwrap();
    let finished = drain(handle).await;
    let file = received.recv().await.unwrap().unwrap();

    let report = match &finished.outcome {
        Outcome::Sent(report) => report,
        other => panic!("transfer failed: {}", other.message()),
    };
    assert_eq!(finished.outcome.message(), "File sent successfully!");
    assert_eq!(report.filename, "notes.txt");
    assert_eq!(report.original_bytes, content.len());
    assert_eq!(report.checksum, file.checksum);
    assert_eq!(report.chunk_count as u64, file.chunk_count);

    assert_eq!(file.path, inbox.path().join("notes.txt"));
    assert_eq!(std::fs::read_to_string(&file.path).unwrap(), content);
}

#[tokio::test]
async fn second_copy_gets_a_new_name() {
    let inbox = tempfile::tempdir().unwrap();

    let bench = Bench::new();
    let peer = device(11);
    let mut received = bench.radio.add_receiver(peer.clone(), 185, receiver_settings(inbox.path()));
    bench.scan();

    for body in [&b"first"[..], &b"second"[..]] {
        let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(body)).unwrap();
        assert!(drain(handle).await.outcome.is_success());
        received.recv().await.unwrap().unwrap();
    }

    assert_eq!(std::fs::read(inbox.path().join("payload.bin")).unwrap(), b"first");
    assert_eq!(std::fs::read(inbox.path().join("payload (1).bin")).unwrap(), b"second");
}

#[tokio::test]
async fn zero_byte_file_is_stored_empty() {
    let inbox = tempfile::tempdir().unwrap();

    let bench = Bench::new();
    let peer = device(12);
    let mut received = bench.radio.add_receiver(peer.clone(), 185, receiver_settings(inbox.path()));
    bench.scan();

    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(b"")).unwrap();
    assert!(drain(handle).await.outcome.is_success());

    let file = received.recv().await.unwrap().unwrap();
    assert_eq!(file.chunk_count, 0);
    assert_eq!(file.bytes, 0);
    assert!(std::fs::read(&file.path).unwrap().is_empty());
}

/// Flips one bit of the first chunk the receiver reads.
struct CorruptFirstChunk {
    inner: StreamLink,
    corrupted: bool,
}

#[async_trait]
impl LinkSession for CorruptFirstChunk {
    fn peer(&self) -> &Peer {
        self.inner.peer()
    }

    fn state(&self) -> watch::Receiver<LinkState> {
        self.inner.state()
    }

    fn mtu(&self) -> Result<usize, LinkError> {
        self.inner.mtu()
    }

    async fn read_bytes(&mut self) -> Result<Bytes, LinkError> {
        let frame = self.inner.read_bytes().await?;
        if self.corrupted || frame.first() != Some(&wire::TAG_CHUNK) || frame.len() < 2 {
            return Ok(frame);
        }
        self.corrupted = true;
        let mut frame = BytesMut::from(&frame[..]);
        frame[1] ^= 0x01;
        Ok(frame.freeze())
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), LinkError> {
        self.inner.write_bytes(bytes).await
    }

    async fn disconnect(&mut self) {
        self.inner.disconnect().await
    }
}

#[tokio::test]
async fn corrupted_chunk_is_rejected_at_completion() {
    let inbox = tempfile::tempdir().unwrap();

    let bench = Bench::new();
    let peer = device(13);
    let mut incoming = bench.radio.add_device(peer.clone(), 185);
    let settings = receiver_settings(inbox.path());
    let receiver = tokio::spawn(async move {
        let link = incoming.recv().await.unwrap();
        let link = CorruptFirstChunk {
            inner: link,
            corrupted: false,
        };
        TransferReceiver::new(link, settings).run().await
    });
    bench.scan();

    let data = crate::noise(600, 42);
    let handle = bench.coordinator.begin_transfer(&peer.id, bytes_source(&data)).unwrap();
    let finished = drain(handle).await;

    assert_eq!(failure(&finished.outcome), AbortReason::CompletionRejected);
    assert!(matches!(
        receiver.await.unwrap(),
        Err(ReceiveError::ChecksumMismatch { .. })
    ));
    assert_eq!(std::fs::read_dir(inbox.path()).unwrap().count(), 0);
}
