//! Transfer coordinator — runs one transfer at a time end to end.
//!
//! Looks the selected peer up in discovery, asks the radio for a link,
//! and spawns a TransferEngine on the runtime. The caller gets a
//! TransferHandle back immediately and observes progress through it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use beamdrop_core::config::BeamdropConfig;
use beamdrop_core::PeerId;

use crate::engine::{EngineSettings, Outcome, TransferEngine, TransferError, TransferEvent, TransferReport, TransferSource};
use crate::link::Radio;
use crate::peer::Discovery;

pub struct TransferCoordinator<R: Radio> {
    radio: Arc<R>,
    discovery: Arc<Discovery>,
    settings: EngineSettings,
    channel: u16,
    busy: Arc<AtomicBool>,
}

impl<R: Radio> TransferCoordinator<R> {
    pub fn new(radio: Arc<R>, discovery: Arc<Discovery>, config: &BeamdropConfig) -> Self {
        Self::with_settings(radio, discovery, EngineSettings::from(config), config.link.channel_psm)
    }

    pub fn with_settings(radio: Arc<R>, discovery: Arc<Discovery>, settings: EngineSettings, channel: u16) -> Self {
        Self {
            radio,
            discovery,
            settings,
            channel,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn discovery(&self) -> &Arc<Discovery> {
        &self.discovery
    }

    /// False while a transfer is running.
    pub fn can_send(&self) -> bool {
        !self.busy.load(Ordering::Acquire)
    }

    /// Start sending `source` to a discovered peer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn begin_transfer(&self, peer_id: &PeerId, source: TransferSource) -> Result<TransferHandle, TransferError> {
        let guard = BusyGuard::acquire(&self.busy).ok_or(TransferError::Busy)?;
        let peer = self
            .discovery
            .get(peer_id)
            .ok_or(TransferError::UnknownPeer(*peer_id))?;
        source.check_readable()?;

        let link = self.radio.connect(&peer, self.channel)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransferEvent::SendEnabled(false));

        tracing::info!(peer = %peer.id, name = peer.display_name(), file = %source.filename(), "starting transfer");

        let engine = TransferEngine::new(link, self.settings.clone(), tx.clone());
        let task = tokio::spawn(async move {
            // A panicking engine still ends with the terminal events.
            let result = match tokio::spawn(engine.run(source)).await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(error = %e, "transfer task failed");
                    Err(TransferError::Interrupted(e.to_string()))
                }
            };
            drop(guard);
            let _ = tx.send(TransferEvent::SendEnabled(true));
            let _ = tx.send(TransferEvent::Finished(Outcome::from_result(&result)));
            result
        });

        Ok(TransferHandle { events: rx, task })
    }
}

/// Marks the coordinator busy for as long as it lives.
struct BusyGuard(Arc<AtomicBool>);

impl BusyGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A running transfer.
pub struct TransferHandle {
    events: mpsc::UnboundedReceiver<TransferEvent>,
    task: JoinHandle<Result<TransferReport, TransferError>>,
}

impl fmt::Debug for TransferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferHandle")
            .field("finished", &self.task.is_finished())
            .finish_non_exhaustive()
    }
}

impl TransferHandle {
    /// Next event, or None once the transfer has finished and every event
    /// was delivered.
    pub async fn next_event(&mut self) -> Option<TransferEvent> {
        self.events.recv().await
    }

    /// Wait for the transfer to end. Undelivered events are discarded.
    pub async fn outcome(self) -> Result<TransferReport, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Interrupted(e.to_string()))?
    }
}
