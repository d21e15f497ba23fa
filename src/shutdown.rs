//! Graceful Shutdown Module
//!
//! Coordinates shutdown across the server and background tasks: a broadcast
//! signal stops accept loops, then the caches are persisted within a bounded
//! grace period so the persistence files reflect the final LRU order.

use crate::cache_manager::CacheManager;
use crate::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub struct ShutdownCoordinator {
    cache_manager: Option<Arc<CacheManager>>,
    shutdown_sender: broadcast::Sender<()>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_sender, _) = broadcast::channel(16);
        Self {
            cache_manager: None,
            shutdown_sender,
            shutdown_timeout,
        }
    }

    pub fn set_cache_manager(&mut self, cache_manager: Arc<CacheManager>) {
        self.cache_manager = Some(cache_manager);
    }

    /// Receiver for components that need to stop on shutdown.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_sender.subscribe()
    }

    /// Block until SIGINT or SIGTERM arrives, then run the shutdown sequence.
    pub async fn listen_for_shutdown(&self) -> Result<()> {
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .map_err(|e| ProxyError::IoError(format!("failed to create SIGINT handler: {e}")))?;
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .map_err(|e| ProxyError::IoError(format!("failed to create SIGTERM handler: {e}")))?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, initiating graceful shutdown");
            }
        }

        self.initiate_shutdown().await
    }

    /// Broadcast the shutdown signal and run the teardown under a timeout.
    pub async fn initiate_shutdown(&self) -> Result<()> {
        if let Err(e) = self.shutdown_sender.send(()) {
            // All receivers already dropped; normal during shutdown.
            debug!("shutdown signal not sent (no active receivers): {e}");
        }

        match timeout(self.shutdown_timeout, self.perform_shutdown()).await {
            Ok(()) => {
                info!("graceful shutdown completed");
                Ok(())
            }
            Err(_) => {
                error!(
                    "graceful shutdown timed out after {:?}",
                    self.shutdown_timeout
                );
                Err(ProxyError::IoError("graceful shutdown timeout".to_string()))
            }
        }
    }

    async fn perform_shutdown(&self) {
        if let Some(cache_manager) = &self.cache_manager {
            info!("persisting caches");
            cache_manager.persist_all().await;
        }

        // Give a moment for final log messages to be written
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Shutdown signal wrapper for accept loops and background tasks.
pub struct ShutdownSignal {
    receiver: broadcast::Receiver<()>,
}

impl ShutdownSignal {
    pub fn new(receiver: broadcast::Receiver<()>) -> Self {
        Self { receiver }
    }

    /// Resolve once shutdown has been requested. A closed or lagged channel
    /// also counts as shutdown.
    pub async fn wait_for_shutdown(&mut self) {
        match self.receiver.recv().await {
            Ok(()) => {}
            Err(broadcast::error::RecvError::Closed) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("shutdown signal lagged by {n} messages");
            }
        }
    }
}
