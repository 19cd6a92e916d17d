//! Endpoint discovery — tracks nearby peers advertising the service.
//!
//! The registry is a concurrent map from peer identifier to PeerEntry,
//! populated by the radio's scan callbacks and read by the caller's peer
//! list and the transfer coordinator. Entries expire after the configured
//! TTL if not refreshed, and the registry never grows past its capacity.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::broadcast;

use beamdrop_core::config::DiscoveryConfig;
use beamdrop_core::PeerId;

use crate::link::{LinkError, Radio};

/// A discoverable remote device. Two peers are the same peer when their
/// identifiers match, whatever name they advertise.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub name: Option<String>,
}

impl Peer {
    pub fn new(id: PeerId, name: Option<String>) -> Self {
        Self { id, name }
    }

    /// Name shown in a peer list.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown Device")
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Tracked state for a discovered peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub peer: Peer,
    /// Insertion order; the registry snapshot is sorted on this.
    pub seq: u64,
    /// Last time the peer was sighted. Used for TTL expiry.
    pub last_seen: Instant,
}

/// The peer registry, shared between the scan callbacks, the expiry task
/// and readers. Keyed on peer identifier.
pub type PeerRegistry = Arc<DashMap<PeerId, PeerEntry>>;

/// Create a new empty peer registry.
pub fn new_registry() -> PeerRegistry {
    Arc::new(DashMap::new())
}

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    Discovered(Peer),
    Lost(Peer),
}

pub struct Discovery {
    service_uuid: String,
    registry: PeerRegistry,
    next_seq: AtomicU64,
    scanning: AtomicBool,
    ttl: Duration,
    max_peers: usize,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl Discovery {
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self::with_limits(
            config.service_uuid.clone(),
            Duration::from_secs(config.peer_ttl_secs),
            config.max_peers,
        )
    }

    pub fn with_limits(service_uuid: impl Into<String>, ttl: Duration, max_peers: usize) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            service_uuid: service_uuid.into(),
            registry: new_registry(),
            next_seq: AtomicU64::new(0),
            scanning: AtomicBool::new(false),
            ttl,
            max_peers: max_peers.max(1),
            events,
        }
    }

    /// Begin scanning. Returns `Ok(false)` when a scan is already running.
    pub fn start<R: Radio>(self: &Arc<Self>, radio: &R) -> Result<bool, LinkError> {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(false);
        }

        if let Err(e) = radio.start_scan(&self.service_uuid, Arc::clone(self)) {
            self.scanning.store(false, Ordering::Release);
            return Err(e);
        }

        tracing::info!(service = %self.service_uuid, "discovery scan started");
        Ok(true)
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Record a sighting. Returns true when the peer was not known before;
    /// only then are observers notified.
    pub fn on_discovered(&self, peer: Peer) -> bool {
        if let Some(mut entry) = self.registry.get_mut(&peer.id) {
            entry.last_seen = Instant::now();
            if peer.name.is_some() {
                entry.peer.name = peer.name;
            }
            return false;
        }

        if self.registry.len() >= self.max_peers {
            self.evict_stalest();
        }

        let mut inserted = false;
        self.registry.entry(peer.id).or_insert_with(|| {
            inserted = true;
            PeerEntry {
                peer: peer.clone(),
                seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
                last_seen: Instant::now(),
            }
        });

        if inserted {
            tracing::debug!(peer = %peer.id, name = peer.display_name(), "peer discovered");
            let _ = self.events.send(DiscoveryEvent::Discovered(peer));
        }
        inserted
    }

    fn evict_stalest(&self) {
        let stalest = self
            .registry
            .iter()
            .min_by_key(|e| e.value().last_seen)
            .map(|e| *e.key());

        if let Some((_, entry)) = stalest.and_then(|id| self.registry.remove(&id)) {
            tracing::debug!(peer = %entry.peer.id, "peer evicted, registry full");
            let _ = self.events.send(DiscoveryEvent::Lost(entry.peer));
        }
    }

    /// Remove entries that have not been seen within the TTL.
    pub fn expire(&self) -> Vec<Peer> {
        let mut lost = Vec::new();
        self.registry.retain(|_, entry| {
            let alive = entry.last_seen.elapsed() < self.ttl;
            if !alive {
                lost.push(entry.peer.clone());
            }
            alive
        });

        for peer in &lost {
            tracing::debug!(peer = %peer.id, "peer expired");
            let _ = self.events.send(DiscoveryEvent::Lost(peer.clone()));
        }
        lost
    }

    /// Snapshot of known peers in the order they were first sighted.
    pub fn peers(&self) -> Vec<Peer> {
        let mut entries: Vec<(u64, Peer)> = self
            .registry
            .iter()
            .map(|e| (e.value().seq, e.value().peer.clone()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, peer)| peer).collect()
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.registry.get(id).map(|e| e.value().peer.clone())
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }
}

/// Periodically drop peers that went quiet.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn expiry_loop(discovery: Arc<Discovery>, check_interval: Duration) {
    let mut interval = tokio::time::interval(check_interval);

    loop {
        interval.tick().await;

        let removed = discovery.expire();
        if !removed.is_empty() {
            tracing::debug!(removed = removed.len(), "expired peer registry entries");
        }
    }
}
