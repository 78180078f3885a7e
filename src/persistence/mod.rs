//! Persistence module for JMQT.
//!
//! Stores what must outlive a single connection:
//! - Presence of connected clients
//! - Subscriptions (persistent and temporary)
//! - Retained messages, one per channel
//! - Pending QoS 1 packets and the per-recipient acks they wait for
//!
//! Uses a trait-based design allowing different backends:
//! - `MemoryBackend` (default) - process-local maps
//! - `FjallBackend` - Local LSM-tree storage

mod backend;
mod error;
mod fjall;
mod memory;
mod models;


pub use backend::StorageBackend;
pub use error::{PersistenceError, Result};
pub use fjall::FjallBackend;
pub use memory::MemoryBackend;
pub use models::{now_millis, PendingAck, PendingPublish, Presence, RetainedMessage, Subscription};

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::{BackendType, PersistenceConfig};

/// Open the backend selected in the configuration
pub fn open_backend(config: &PersistenceConfig) -> Result<Arc<dyn StorageBackend>> {
    match config.backend {
        BackendType::Memory => Ok(Arc::new(MemoryBackend::new())),
        BackendType::Fjall => {
            info!("Opening fjall store at {}", config.path.display());
            Ok(Arc::new(FjallBackend::open(&config.path)?))
        }
    }
}

/// Background task that periodically reclaims pending packets no
/// recipient is waiting for any more
pub struct Reconciler {
    shutdown_tx: mpsc::Sender<()>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Reconciler {
    /// Spawn the reconciliation loop
    pub fn start(backend: Arc<dyn StorageBackend>, interval: Duration) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Self::reconcile_loop(backend, shutdown_rx, interval));

        Self {
            shutdown_tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// One reconciliation pass. Packets younger than `grace` are left alone
    /// so a publish still writing its ack rows is never reclaimed.
    pub async fn run_once(backend: &dyn StorageBackend, grace: Duration) -> Result<usize> {
        let cutoff = now_millis().saturating_sub(grace.as_millis() as u64);
        backend.reclaim_orphans(cutoff).await
    }

    /// Stop the loop and wait for it to exit
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn reconcile_loop(
        backend: Arc<dyn StorageBackend>,
        mut shutdown_rx: mpsc::Receiver<()>,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match Self::run_once(backend.as_ref(), interval).await {
                        Ok(0) => {}
                        Ok(count) => debug!("Reclaimed {} orphaned pending packets", count),
                        Err(e) => error!("Reconciliation failed: {}", e),
                    }
                }

                _ = shutdown_rx.recv() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }
            }
        }

        if let Err(e) = backend.flush().await {
            error!("Failed to flush store on shutdown: {}", e);
        }
    }
}
