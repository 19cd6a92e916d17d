//! Advertisement listener.
//!
//! Joins the ff02::1 multicast group and listens for Advertisement
//! datagrams from nearby devices. Valid advertisements for our service
//! are reported to discovery and their channel address remembered for
//! connecting later.

use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use beamdrop_core::wire::Advertisement;
use beamdrop_core::PeerId;
use beamdrop_services::{Discovery, Peer};

use super::{AddressBook, MULTICAST_ADDR};

/// Listen for advertisements and feed them to discovery.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn scan_loop(
    socket: std::net::UdpSocket,
    service: [u8; 16],
    local: PeerId,
    discovery: Arc<Discovery>,
    addresses: AddressBook,
) -> Result<()> {
    let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;
    let mut buf = vec![0u8; 1024];

    tracing::info!(port = socket.local_addr()?.port(), "advertisement listener starting");

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "recv_from failed");
                continue;
            }
        };

        let from = match from {
            SocketAddr::V6(v6) => v6,
            SocketAddr::V4(_) => {
                tracing::warn!("received IPv4 datagram on IPv6 socket, ignoring");
                continue;
            }
        };

        let advertisement = match Advertisement::parse(&buf[..len]) {
            Ok(a) => a,
            Err(e) => {
                tracing::trace!(error = %e, from = %from, "ignoring malformed advertisement");
                continue;
            }
        };

        if advertisement.service != service {
            tracing::trace!(from = %from, "advertisement for another service");
            continue;
        }

        let id = advertisement.peer_id();
        if id == local {
            tracing::trace!("ignoring own advertisement");
            continue;
        }

        let channel = SocketAddr::V6(SocketAddrV6::new(
            *from.ip(),
            advertisement.port(),
            0,
            from.scope_id(),
        ));
        addresses.insert(id, channel);

        if discovery.on_discovered(Peer::new(id, advertisement.name())) {
            tracing::debug!(peer = %id, addr = %channel, "device advertised");
        }
    }
}

/// Create a UDP socket joined to the ff02::1 multicast group.
pub fn make_listener_socket(interface_index: u32, port: u16) -> Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket.set_only_v6(true).context("IPV6_V6ONLY")?;
    socket.set_nonblocking(true).context("set_nonblocking")?;

    let bind_addr = SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0);
    socket.bind(&bind_addr.into()).context("bind()")?;

    socket
        .join_multicast_v6(&MULTICAST_ADDR, interface_index)
        .context("IPV6_JOIN_GROUP")?;

    Ok(socket.into())
}
