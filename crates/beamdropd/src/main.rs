//! beamdropd — send and receive files between nearby devices.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use beamdrop_core::config::BeamdropConfig;
use beamdrop_core::wire::{parse_uuid, Advertisement};
use beamdrop_core::PeerId;
use beamdrop_services::peer::expiry_loop;
use beamdrop_services::receiver::ReceiverSettings;
use beamdrop_services::{Discovery, Peer, TransferCoordinator, TransferEvent, TransferSource, TransferState};

mod args;
mod radio;

use args::{Args, Command};
use radio::{advertise, channel, LanRadio};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Load config
    if let Err(e) = BeamdropConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = BeamdropConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        BeamdropConfig::default()
    });
    if let Some(interface) = args.interface {
        config.discovery.interface = interface;
    }

    match args.command {
        Command::Receive { dir, name } => {
            if let Some(dir) = dir {
                config.transfer.receive_dir = dir;
            }
            if let Some(name) = name {
                config.transfer.device_name = name;
            }
            receive(config).await
        }
        Command::Peers { wait } => peers(config, Duration::from_secs(wait)).await,
        Command::Send { peer, file, wait } => send(config, &peer, file, Duration::from_secs(wait)).await,
    }
}

// ── Receive ───────────────────────────────────────────────────────────────────

async fn receive(config: BeamdropConfig) -> Result<()> {
    let interface_index = advertise::if_index(&config.discovery.interface)?;
    let service = parse_uuid(&config.discovery.service_uuid).context("invalid service uuid in config")?;
    if config.link.mtu < 2 {
        anyhow::bail!("link mtu {} is too small", config.link.mtu);
    }

    let listener = TcpListener::bind(("::", config.link.channel_port))
        .await
        .context("failed to bind channel listener")?;
    let channel_port = listener.local_addr()?.port();

    let name = if config.transfer.device_name.is_empty() {
        advertise::hostname()
    } else {
        config.transfer.device_name.clone()
    };
    let local = PeerId::generate();
    let advertisement = Advertisement::new(service, local, channel_port, &name);

    tracing::info!(
        id = %local,
        name = %name,
        dir = %config.transfer.receive_dir.display(),
        "beamdropd receiving"
    );

    let advertise_task = tokio::spawn(advertise::advertise_loop(
        advertisement,
        interface_index,
        config.discovery.advertise_port,
        Duration::from_secs(config.discovery.announce_interval_secs.max(1)),
    ));
    let serve_task = tokio::spawn(channel::serve(
        listener,
        config.link.channel_psm,
        config.link.mtu,
        ReceiverSettings::from(&config),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        r = advertise_task => tracing::error!("advertise task exited: {:?}", r),
        r = serve_task     => tracing::error!("channel server exited: {:?}", r),
    }
    Ok(())
}

// ── Discover ──────────────────────────────────────────────────────────────────

fn start_discovery(config: &BeamdropConfig) -> Result<(Arc<LanRadio>, Arc<Discovery>)> {
    let interface_index = advertise::if_index(&config.discovery.interface)?;
    let radio = Arc::new(LanRadio::new(
        PeerId::generate(),
        interface_index,
        config.discovery.advertise_port,
    ));
    let discovery = Arc::new(Discovery::new(&config.discovery));
    discovery.start(&*radio).context("failed to start scanning")?;

    tokio::spawn(expiry_loop(Arc::clone(&discovery), Duration::from_secs(1)));
    Ok((radio, discovery))
}

async fn peers(config: BeamdropConfig, wait: Duration) -> Result<()> {
    let (_radio, discovery) = start_discovery(&config)?;
    tokio::time::sleep(wait).await;

    let found = discovery.peers();
    if found.is_empty() {
        println!("no devices found");
    }
    for peer in found {
        println!("{}  {}", peer.id, peer.display_name());
    }
    Ok(())
}

// ── Send ──────────────────────────────────────────────────────────────────────

fn matches_selector(peer: &Peer, selector: &str) -> bool {
    peer.name.as_deref() == Some(selector) || peer.id.to_string().starts_with(&selector.to_ascii_lowercase())
}

async fn find_peer(discovery: &Discovery, selector: &str, wait: Duration) -> Result<Peer> {
    let mut events = discovery.subscribe();
    let deadline = tokio::time::Instant::now() + wait;

    loop {
        if let Some(peer) = discovery.peers().into_iter().find(|p| matches_selector(p, selector)) {
            return Ok(peer);
        }
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => {}
            Ok(Err(RecvError::Closed)) | Err(_) => {
                anyhow::bail!("no device matching {selector:?} found within {}s", wait.as_secs())
            }
        }
    }
}

async fn send(config: BeamdropConfig, selector: &str, file: PathBuf, wait: Duration) -> Result<()> {
    let (radio, discovery) = start_discovery(&config)?;
    let peer = find_peer(&discovery, selector, wait).await?;
    tracing::info!(peer = %peer.id, name = peer.display_name(), "device found");

    let coordinator = TransferCoordinator::new(radio, Arc::clone(&discovery), &config);
    let mut handle = coordinator
        .begin_transfer(&peer.id, TransferSource::Path(file.clone()))
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("cannot send {}", file.display()))?;

    let mut outcome = None;
    while let Some(event) = handle.next_event().await {
        match event {
            TransferEvent::State(TransferState::Connecting) => {
                println!("connecting to {}...", peer.display_name())
            }
            TransferEvent::Progress { sent, total } => {
                print!("\rsending chunk {sent}/{total}");
                std::io::stdout().flush().ok();
                if sent == total {
                    println!();
                }
            }
            TransferEvent::Finished(o) => outcome = Some(o),
            _ => {}
        }
    }

    match outcome {
        Some(o) if o.is_success() => {
            println!("{}", o.message());
            Ok(())
        }
        Some(o) => anyhow::bail!(o.message()),
        None => Err(handle_failure(handle).await),
    }
}

async fn handle_failure(handle: beamdrop_services::TransferHandle) -> anyhow::Error {
    match handle.outcome().await {
        Ok(_) => anyhow::anyhow!("transfer ended without reporting an outcome"),
        Err(e) => anyhow::Error::new(e).context("transfer failed"),
    }
}
