//! Discovery feeding the coordinator.

use std::time::Duration;

use beamdrop_services::{DiscoveryEvent, TransferError};

use crate::{bytes_source, device, drain, receiver_settings, Bench};

#[tokio::test]
async fn scan_reports_every_registered_device_once() {
    let bench = Bench::new();
    bench.radio.add_unreachable(device(1));
    bench.radio.add_without_channel(device(2));
    let _incoming = bench.radio.add_device(device(3), 185);

    let mut events = bench.discovery.subscribe();
    bench.scan();
    assert!(bench.discovery.is_scanning());

    let mut seen = Vec::new();
    for _ in 0..3 {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Ok(DiscoveryEvent::Discovered(peer))) => seen.push(peer.id),
            other => panic!("unexpected discovery event {other:?}"),
        }
    }
    seen.sort_by_key(|id| id.0);
    assert_eq!(seen, vec![device(1).id, device(2).id, device(3).id]);

    // Sightings of known devices refresh them without a new event.
    assert!(!bench.discovery.on_discovered(device(2)));
    assert!(events.try_recv().is_err());
    assert_eq!(bench.discovery.len(), 3);
}

#[tokio::test]
async fn expired_device_cannot_be_selected() {
    let bench = Bench::new();
    let inbox = tempfile::tempdir().unwrap();
    let peer = device(4);
    let _received = bench.radio.add_receiver(peer.clone(), 185, receiver_settings(inbox.path()));

    let discovery = std::sync::Arc::new(beamdrop_services::Discovery::with_limits(
        beamdrop_core::wire::SERVICE_UUID,
        Duration::from_millis(50),
        16,
    ));
    let coordinator = beamdrop_services::TransferCoordinator::with_settings(
        std::sync::Arc::clone(&bench.radio),
        std::sync::Arc::clone(&discovery),
        crate::settings(),
        beamdrop_core::wire::CHANNEL_PSM,
    );
    discovery.start(&*bench.radio).unwrap();
    assert!(discovery.get(&peer.id).is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;
    let lost = discovery.expire();
    assert_eq!(lost, vec![peer.clone()]);

    let err = coordinator.begin_transfer(&peer.id, bytes_source(b"late")).unwrap_err();
    assert!(matches!(err, TransferError::UnknownPeer(id) if id == peer.id));
    assert_eq!(err.user_message(), "Selected device is no longer available.");
    assert!(coordinator.can_send());
}

#[tokio::test]
async fn sending_is_disabled_while_a_transfer_runs() {
    let inbox = tempfile::tempdir().unwrap();
    let bench = Bench::new();
    let busy = device(5);
    let idle = device(6);
    bench.radio.add_unreachable(busy.clone());
    let mut received = bench.radio.add_receiver(idle.clone(), 185, receiver_settings(inbox.path()));
    bench.scan();

    let first = bench.coordinator.begin_transfer(&busy.id, bytes_source(b"a")).unwrap();
    assert!(!bench.coordinator.can_send());
    let err = bench
        .coordinator
        .begin_transfer(&idle.id, bytes_source(b"b"))
        .unwrap_err();
    assert!(matches!(err, TransferError::Busy));

    let finished = drain(first).await;
    assert!(!finished.outcome.is_success());
    assert!(bench.coordinator.can_send());

    let second = bench.coordinator.begin_transfer(&idle.id, bytes_source(b"b")).unwrap();
    assert!(drain(second).await.outcome.is_success());
    assert!(received.recv().await.unwrap().is_ok());
}
