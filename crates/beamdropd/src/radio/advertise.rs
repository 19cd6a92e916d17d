//! Advertisement broadcast.
//!
//! Periodically sends an Advertisement datagram to the link-local
//! multicast address ff02::1 so nearby devices can discover this one
//! and learn which port its channel listens on.

use std::net::{Ipv6Addr, SocketAddrV6};
use std::time::Duration;

use anyhow::{Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::time;
use zerocopy::AsBytes;

use beamdrop_core::wire::Advertisement;

use super::MULTICAST_ADDR;

/// Broadcast `advertisement` every `interval`.
///
/// Runs forever. Cancel by dropping the task handle.
///
/// # Arguments
/// * `interface_index` - The OS interface index to send on (0 = system default).
/// * `port` - UDP port scanners listen on.
pub async fn advertise_loop(
    advertisement: Advertisement,
    interface_index: u32,
    port: u16,
    interval: Duration,
) -> Result<()> {
    let socket = make_multicast_socket(interface_index)
        .context("failed to create multicast advertise socket")?;

    let dest = SocketAddrV6::new(MULTICAST_ADDR, port, 0, interface_index);
    let mut interval = time::interval(interval);

    tracing::info!(
        interface_index,
        port,
        channel_port = advertisement.port(),
        "advertising"
    );

    loop {
        interval.tick().await;

        match socket.send_to(advertisement.as_bytes(), &dest.into()) {
            Ok(n) => tracing::trace!(bytes = n, "advertisement sent"),
            Err(e) => tracing::warn!(error = %e, "advertisement send failed"),
        }
    }
}

/// Create a UDP socket suitable for sending IPv6 multicast.
fn make_multicast_socket(interface_index: u32) -> Result<Socket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP)).context("socket()")?;

    socket.set_reuse_address(true).context("SO_REUSEADDR")?;
    socket
        .set_multicast_if_v6(interface_index)
        .context("IPV6_MULTICAST_IF")?;
    // TTL 1: link-local only
    socket.set_multicast_hops_v6(1).context("IPV6_MULTICAST_HOPS")?;
    // Scanners on this host should hear us too.
    socket.set_multicast_loop_v6(true).context("IPV6_MULTICAST_LOOP")?;

    Ok(socket)
}

/// Get the OS interface index for a named network interface.
/// An empty name selects the system default (index 0).
pub fn if_index(name: &str) -> Result<u32> {
    if name.is_empty() {
        return Ok(0);
    }
    let name_cstr = std::ffi::CString::new(name).context("interface name contains null byte")?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    if index == 0 {
        anyhow::bail!("interface '{}' not found", name);
    }
    Ok(index)
}

/// This host's name, used when no device name is configured.
pub fn hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return "beamdrop".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..len]).into_owned()
}
