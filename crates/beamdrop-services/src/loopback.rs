//! In-process radio. Devices are registered up front; connecting to one
//! yields a StreamLink over a `tokio::io::duplex` pipe whose far end is
//! handed to whoever serves that device.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use beamdrop_core::PeerId;

use crate::link::{ChannelIo, LinkError, Radio, StreamLink, SDU_HEADER_LEN};
use crate::peer::{Discovery, Peer};
use crate::receiver::{ReceivedFile, ReceiveError, ReceiverSettings, TransferReceiver};

#[derive(Clone)]
enum Reachability {
    /// Link and channel open; far ends are sent down the channel.
    Accepting { mtu: usize, accept: mpsc::UnboundedSender<StreamLink> },
    /// Radio link comes up, the channel never opens.
    NoChannel,
    /// Never answers.
    Unreachable,
}

struct Device {
    peer: Peer,
    reach: Reachability,
}

pub struct LoopbackRadio {
    local: Peer,
    devices: DashMap<PeerId, Device>,
}

impl Default for LoopbackRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRadio {
    pub fn new() -> Self {
        Self::with_identity(Peer::new(PeerId::generate(), Some("loopback".to_string())))
    }

    /// `local` is the peer the far ends see as their counterpart.
    pub fn with_identity(local: Peer) -> Self {
        Self {
            local,
            devices: DashMap::new(),
        }
    }

    /// Register a device that accepts channels. Every connection to it
    /// delivers the far end of the link on the returned receiver.
    pub fn add_device(&self, peer: Peer, mtu: usize) -> mpsc::UnboundedReceiver<StreamLink> {
        let (accept, rx) = mpsc::unbounded_channel();
        self.insert(peer, Reachability::Accepting { mtu, accept });
        rx
    }

    /// Register a device served by a TransferReceiver for each connection.
    pub fn add_receiver(
        &self,
        peer: Peer,
        mtu: usize,
        settings: ReceiverSettings,
    ) -> mpsc::UnboundedReceiver<Result<ReceivedFile, ReceiveError>> {
        let mut incoming = self.add_device(peer, mtu);
        let (done_tx, done_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                let result = TransferReceiver::new(link, settings.clone()).run().await;
                if done_tx.send(result).is_err() {
                    break;
                }
            }
        });
        done_rx
    }

    pub fn add_without_channel(&self, peer: Peer) {
        self.insert(peer, Reachability::NoChannel);
    }

    pub fn add_unreachable(&self, peer: Peer) {
        self.insert(peer, Reachability::Unreachable);
    }

    fn insert(&self, peer: Peer, reach: Reachability) {
        self.devices.insert(peer.id, Device { peer, reach });
    }
}

impl Radio for LoopbackRadio {
    type Link = StreamLink;

    fn start_scan(&self, _service: &str, discovery: Arc<Discovery>) -> Result<(), LinkError> {
        for device in self.devices.iter() {
            discovery.on_discovered(device.peer.clone());
        }
        Ok(())
    }

    fn connect(&self, peer: &Peer, _channel: u16) -> Result<StreamLink, LinkError> {
        let reach = self
            .devices
            .get(&peer.id)
            .map(|d| d.reach.clone())
            .ok_or(LinkError::UnknownPeer(peer.id))?;

        let (link, opener) = StreamLink::pending(peer.clone());
        match reach {
            Reachability::Unreachable => {}
            Reachability::NoChannel => opener.link_up(),
            Reachability::Accepting { mtu, accept } => {
                opener.link_up();
                let (near, far) = tokio::io::duplex(mtu + SDU_HEADER_LEN);
                let remote = StreamLink::established(self.local.clone(), ChannelIo::split(far, mtu));
                if accept.send(remote).is_err() {
                    opener.fail("device stopped accepting");
                } else {
                    opener.open(ChannelIo::split(near, mtu));
                }
            }
        }
        Ok(link)
    }
}
