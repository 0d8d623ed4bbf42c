//! Cooperative cancellation
//!
//! A [`CancellationSource`] is owned by whoever hosts the work (the service
//! wiring background fixers, a request handler); it hands out cheap
//! [`CancellationToken`] clones that operations check before issuing I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use super::{ProjectionError, Result};

/// Token checked by cancellable operations
#[derive(Clone, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    watch_rx: Option<watch::Receiver<bool>>,
}

impl CancellationToken {
    /// A token that never fires
    pub fn none() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            watch_rx: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(ProjectionError::Cancelled)` once cancellation was requested
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }
        Ok(())
    }

    /// Completes when cancellation is requested; pending forever for `none()`
    pub async fn cancelled(&self) {
        match &self.watch_rx {
            Some(rx) => {
                let mut rx = rx.clone();
                // An error means the source was dropped without cancelling.
                if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::none()
    }
}

/// Owner side of a cancellation scope
#[derive(Debug)]
pub struct CancellationSource {
    cancelled: Arc<AtomicBool>,
    watch_tx: watch::Sender<bool>,
}

impl CancellationSource {
    pub fn new() -> Self {
        let (watch_tx, _) = watch::channel(false);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            watch_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            cancelled: self.cancelled.clone(),
            watch_rx: Some(self.watch_tx.subscribe()),
        }
    }

    /// Request cancellation; idempotent
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Cancellation requested");
        self.watch_tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}
