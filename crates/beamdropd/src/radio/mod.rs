//! LAN radio — emulates the short-range radio over IPv6 link-local
//! multicast (discovery) and TCP (the logical channel).

use std::net::{Ipv6Addr, SocketAddr};
use std::sync::Arc;

use dashmap::DashMap;

use beamdrop_core::wire::parse_uuid;
use beamdrop_core::PeerId;
use beamdrop_services::link::{LinkError, Radio};
use beamdrop_services::{Discovery, Peer, StreamLink};

pub mod advertise;
pub mod channel;
pub mod scan;

/// All-nodes link-local multicast group.
pub const MULTICAST_ADDR: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// Channel address of every advertised device, keyed on peer id.
pub type AddressBook = Arc<DashMap<PeerId, SocketAddr>>;

pub struct LanRadio {
    local: PeerId,
    interface_index: u32,
    advertise_port: u16,
    addresses: AddressBook,
}

impl LanRadio {
    pub fn new(local: PeerId, interface_index: u32, advertise_port: u16) -> Self {
        Self {
            local,
            interface_index,
            advertise_port,
            addresses: Arc::new(DashMap::new()),
        }
    }
}

impl Radio for LanRadio {
    type Link = StreamLink;

    fn start_scan(&self, service: &str, discovery: Arc<Discovery>) -> Result<(), LinkError> {
        let service = parse_uuid(service).map_err(|e| LinkError::Radio(e.to_string()))?;
        let socket = scan::make_listener_socket(self.interface_index, self.advertise_port)
            .map_err(|e| LinkError::Radio(format!("{e:#}")))?;

        let addresses = Arc::clone(&self.addresses);
        let local = self.local;
        tokio::spawn(async move {
            if let Err(e) = scan::scan_loop(socket, service, local, discovery, addresses).await {
                tracing::error!(error = %e, "advertisement listener failed");
            }
        });
        Ok(())
    }

    fn connect(&self, peer: &Peer, channel: u16) -> Result<StreamLink, LinkError> {
        let addr = self
            .addresses
            .get(&peer.id)
            .map(|a| *a.value())
            .ok_or(LinkError::UnknownPeer(peer.id))?;

        tracing::debug!(peer = %peer.id, addr = %addr, channel, "connecting");
        let (mut link, opener) = StreamLink::pending(peer.clone());
        link.attach_task(tokio::spawn(channel::dial(addr, channel, opener)));
        Ok(link)
    }
}
