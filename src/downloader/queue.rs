//! Per-provider admission queue
//!
//! One [`ProviderQueue`] exists per provider. It holds two bounded lanes —
//! loading and downloading — and runs exactly one worker task, which is what
//! enforces the "at most one item loading or downloading per provider"
//! invariant without any extra locking. The worker always drains the loading
//! lane first so a long download can never starve freshly queued metadata
//! fetches.

use crate::config::Config;
use crate::content::{lock, ContentItem};
use crate::error::{Error, Result};
use crate::types::{ContentState, Provider};

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The queue for one provider, with a single internal worker.
///
/// The worker empties the loading lane before touching the download lane.
/// Both lanes are bounded; adds fail fast with
/// [`Error::QueueFull`] instead of blocking the caller. The worker is
/// started on construction.
pub(crate) struct ProviderQueue {
    provider: Provider,
    loading_tx: mpsc::Sender<Arc<ContentItem>>,
    download_tx: mpsc::Sender<Arc<ContentItem>>,
    token: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    shutdown_wait: Duration,
}

impl ProviderQueue {
    pub(crate) fn new(
        provider: Provider,
        parent: &CancellationToken,
        config: &Config,
    ) -> Self {
        let token = parent.child_token();
        let capacity = config.provider_queue_capacity;
        let (loading_tx, loading_rx) = mpsc::channel(capacity);
        let (download_tx, download_rx) = mpsc::channel(capacity);

        let worker = tokio::spawn(worker_loop(
            provider,
            token.clone(),
            loading_rx,
            download_rx,
            download_tx.clone(),
        ));

        Self {
            provider,
            loading_tx,
            download_tx,
            token,
            worker: Mutex::new(Some(worker)),
            shutdown_wait: config.queue_shutdown_wait,
        }
    }

    /// Queue an item for metadata loading. Fails fast when the lane is full.
    pub(crate) fn add_to_loading_queue(&self, item: Arc<ContentItem>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.loading_tx.try_send(item).map_err(|error| match error {
            TrySendError::Full(_) => Error::QueueFull {
                provider: self.provider,
            },
            TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    /// Queue a ready item for downloading. Fails fast when the lane is full.
    pub(crate) fn add_to_download_queue(&self, item: Arc<ContentItem>) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        self.download_tx.try_send(item).map_err(|error| match error {
            TrySendError::Full(_) => Error::QueueFull {
                provider: self.provider,
            },
            TrySendError::Closed(_) => Error::ShuttingDown,
        })
    }

    /// Cancel the worker and wait, bounded, for it to exit.
    ///
    /// No lane writes happen after this returns.
    pub(crate) async fn shutdown(&self) {
        tracing::debug!(provider = %self.provider, "shutting down provider queue");

        self.token.cancel();

        let worker = lock(&self.worker).take();
        if let Some(worker) = worker {
            match tokio::time::timeout(self.shutdown_wait, worker).await {
                Ok(_) => {
                    tracing::debug!(provider = %self.provider, "provider queue shutdown complete");
                }
                Err(_) => {
                    tracing::warn!(provider = %self.provider, "provider queue shutdown timeout");
                }
            }
        }
    }
}

/// The single worker: loading lane strictly first, then either lane.
async fn worker_loop(
    provider: Provider,
    token: CancellationToken,
    mut loading_rx: mpsc::Receiver<Arc<ContentItem>>,
    mut download_rx: mpsc::Receiver<Arc<ContentItem>>,
    download_tx: mpsc::Sender<Arc<ContentItem>>,
) {
    tracing::debug!(%provider, "provider worker started");

    loop {
        // Non-blocking priority check so a queued load always wins over a
        // pending download
        match loading_rx.try_recv() {
            Ok(item) => {
                process_load(&token, &download_tx, item).await;
                continue;
            }
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            item = loading_rx.recv() => {
                match item {
                    Some(item) => process_load(&token, &download_tx, item).await,
                    None => break,
                }
            }
            item = download_rx.recv() => {
                match item {
                    Some(item) => {
                        tracing::debug!(%provider, content_id = %item.id(), "starting download");
                        item.download_content(&token).await;
                    }
                    None => break,
                }
            }
        }
    }

    tracing::debug!(%provider, "provider worker stopped");
}

/// Load an item's metadata and promote it to the download lane when ready
async fn process_load(
    token: &CancellationToken,
    download_tx: &mpsc::Sender<Arc<ContentItem>>,
    item: Arc<ContentItem>,
) {
    tracing::debug!(
        content_id = %item.id(),
        title = %item.title(),
        "starting load info"
    );

    item.load_metadata(token).await;

    if item.state() == ContentState::Ready {
        tracing::trace!(
            content_id = %item.id(),
            "content is ready after loading info, moving to download queue"
        );
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            result = download_tx.send(item) => {
                if result.is_err() {
                    tracing::warn!("download lane closed before promotion");
                }
            }
        }
    }
}
