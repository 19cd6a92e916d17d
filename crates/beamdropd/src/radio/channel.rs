//! Emulated logical channel over TCP.
//!
//! The connecting side sends the 2-byte channel identifier; the accepting
//! side answers with the 2-byte MTU it grants, or closes the stream when
//! it does not serve that channel. Both values are big-endian. After that
//! the stream carries length-prefixed SDUs (see `StreamLink`).

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use beamdrop_core::PeerId;
use beamdrop_services::link::{ChannelIo, ChannelOpener};
use beamdrop_services::receiver::{ReceiverSettings, TransferReceiver};
use beamdrop_services::{Peer, StreamLink};

/// Connection task for one outgoing link.
pub async fn dial(addr: SocketAddr, channel: u16, opener: ChannelOpener) {
    let mut stream = match TcpStream::connect(addr).await {
        Ok(s) => s,
        Err(e) => {
            opener.fail(&e.to_string());
            return;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!(error = %e, "TCP_NODELAY");
    }
    opener.link_up();
    tracing::debug!(addr = %addr, "radio link up");

    match request_channel(&mut stream, channel).await {
        Ok(mtu) => {
            tracing::debug!(addr = %addr, mtu, "channel open");
            opener.open(ChannelIo::split(stream, mtu));
        }
        Err(e) => opener.fail(&format!("{e:#}")),
    }
}

async fn request_channel(stream: &mut TcpStream, channel: u16) -> Result<usize> {
    stream
        .write_all(&channel.to_be_bytes())
        .await
        .context("sending channel id")?;

    let mut granted = [0u8; 2];
    stream
        .read_exact(&mut granted)
        .await
        .context("channel refused")?;

    let mtu = u16::from_be_bytes(granted) as usize;
    if mtu < 2 {
        anyhow::bail!("peer granted unusable mtu {mtu}");
    }
    Ok(mtu)
}

/// Accept channels and serve one transfer per connection, one at a time.
///
/// Runs forever. Cancel by dropping the task handle.
pub async fn serve(listener: TcpListener, channel: u16, mtu: u16, settings: ReceiverSettings) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, channel, mtu, "accepting channels");

    loop {
        let (stream, from) = match listener.accept().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        let link = match accept_channel(stream, channel, mtu, settings.read_timeout).await {
            Ok(io) => StreamLink::established(Peer::new(PeerId([0; 16]), Some(from.to_string())), io),
            Err(e) => {
                tracing::debug!(from = %from, error = %format!("{e:#}"), "channel rejected");
                continue;
            }
        };

        tracing::info!(from = %from, "incoming transfer");
        match TransferReceiver::new(link, settings.clone()).run().await {
            Ok(file) => println!("received {} ({} bytes)", file.path.display(), file.bytes),
            Err(e) => tracing::warn!(from = %from, error = %e, "incoming transfer failed"),
        }
    }
}

async fn accept_channel(
    mut stream: TcpStream,
    channel: u16,
    mtu: u16,
    timeout: Option<Duration>,
) -> Result<ChannelIo> {
    let mut requested = [0u8; 2];
    let read = stream.read_exact(&mut requested);
    match timeout {
        Some(limit) => {
            tokio::time::timeout(limit, read)
                .await
                .context("no channel request")??;
        }
        None => {
            read.await?;
        }
    }

    let requested = u16::from_be_bytes(requested);
    if requested != channel {
        anyhow::bail!("unknown channel 0x{requested:x}");
    }

    stream.set_nodelay(true).context("TCP_NODELAY")?;
    stream.write_all(&mtu.to_be_bytes()).await.context("granting mtu")?;
    Ok(ChannelIo::split(stream, mtu as usize))
}
