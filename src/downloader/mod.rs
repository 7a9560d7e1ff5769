//! Core downloader implementation split into focused submodules.
//!
//! The `MediaDownloader` struct and its methods are organized by domain:
//! - [`admission`] - request intake and per-provider admission control
//! - [`control`] - removal, authorization and observer surface
//! - [`cleanup`] - deleting or archiving a removed item's output
//! - [`queue`] - the per-provider two-lane queue and its single worker

mod admission;
mod cleanup;
mod control;
mod queue;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub(crate) use queue::ProviderQueue;

use crate::config::Config;
use crate::content::ContentItem;
use crate::error::{Error, Result};
use crate::registry::{Registry, RepositoryFactory};
use crate::transform::{NoOpTransform, Transform};
use crate::types::{Event, Provider, QueueStat, StopRequest};

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Requests items send back to the client that owns them.
///
/// Items never hold a handle to the client; this channel is the only edge
/// pointing back, which keeps ownership a strict tree.
pub(crate) enum ClientCommand {
    /// Remove the item from the active set, optionally deleting its files
    Remove(StopRequest),
}

/// Shared mutable state of the client
#[derive(Clone)]
pub(crate) struct ClientState {
    /// Authoritative map of active content by id
    pub(crate) active: Arc<Mutex<HashMap<String, Arc<ContentItem>>>>,
    /// Per-provider waiting lists of deferred requests
    pub(crate) waiting: Arc<Mutex<HashMap<Provider, VecDeque<QueueStat>>>>,
    /// Lazily created per-provider queues
    pub(crate) queues: Arc<Mutex<HashMap<Provider, Arc<ProviderQueue>>>>,
    /// Cleared during shutdown so new requests are rejected
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Root cancellation token all queue workers derive from
    pub(crate) root_token: CancellationToken,
    /// Tracks background removal/cleanup tasks for bounded shutdown
    pub(crate) cleanup_tasks: TaskTracker,
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
///
/// Owns every active [`ContentItem`], routes new requests through per-provider
/// admission control, and drives deferred requests when providers free up.
#[derive(Clone)]
pub struct MediaDownloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Provider repository factories
    pub(crate) registry: Registry,
    /// Transform applied by every item's I/O stage
    pub(crate) transform: Arc<dyn Transform>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Sender handed to items so they can request their own removal
    pub(crate) command_tx: mpsc::UnboundedSender<ClientCommand>,
    /// Shared mutable state
    pub(crate) state: ClientState,
}

impl MediaDownloader {
    /// Create a new MediaDownloader instance
    ///
    /// Validates the configuration, ensures the root directory exists, and
    /// starts the internal command dispatcher. Providers are registered
    /// afterwards with [`register_provider`](Self::register_provider).
    pub async fn new(config: Config) -> Result<Self> {
        Self::new_with_transform(config, Arc::new(NoOpTransform)).await
    }

    /// Create a new instance with a custom I/O stage transform
    pub async fn new_with_transform(
        config: Config,
        transform: Arc<dyn Transform>,
    ) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.root_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create root directory '{}': {}",
                        config.root_dir.display(),
                        e
                    ),
                ))
            })?;

        // Buffered so slow subscribers don't stall the pipeline
        let (event_tx, _rx) = broadcast::channel(1000);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let cleanup_tasks = TaskTracker::new();
        cleanup_tasks.close();

        let downloader = Self {
            config: Arc::new(config),
            registry: Registry::new(),
            transform,
            event_tx,
            command_tx,
            state: ClientState {
                active: Arc::new(Mutex::new(HashMap::new())),
                waiting: Arc::new(Mutex::new(HashMap::new())),
                queues: Arc::new(Mutex::new(HashMap::new())),
                accepting_new: Arc::new(AtomicBool::new(true)),
                root_token: CancellationToken::new(),
                cleanup_tasks,
            },
        };

        downloader.spawn_command_dispatcher(command_rx);

        Ok(downloader)
    }

    /// Register (or replace) the repository factory for a provider
    pub fn register_provider(&self, provider: Provider, factory: RepositoryFactory) {
        self.registry.register(provider, factory);
    }

    /// Subscribe to lifecycle events
    ///
    /// Multiple subscribers are supported; each receives all events
    /// independently. A subscriber that falls more than 1000 events behind
    /// receives a `RecvError::Lagged` error.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped;
    /// downloads never depend on anyone listening.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Drain removal requests items send from inside their own pipelines
    fn spawn_command_dispatcher(&self, mut receiver: mpsc::UnboundedReceiver<ClientCommand>) {
        let downloader = self.clone();
        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    biased;
                    _ = downloader.state.root_token.cancelled() => return,
                    command = receiver.recv() => command,
                };
                let Some(command) = command else { return };

                match command {
                    ClientCommand::Remove(request) => {
                        let id = request.id.clone();
                        match downloader.remove_download(request).await {
                            Ok(()) => {}
                            // Cancel and completion can race to request the
                            // same removal; losing is fine
                            Err(Error::NotFound(_)) => {
                                tracing::debug!(content_id = %id, "removal already handled");
                            }
                            Err(error) => {
                                tracing::warn!(content_id = %id, %error, "failed to remove download");
                            }
                        }
                    }
                }
            }
        });
    }

    /// Gracefully shut down the downloader.
    ///
    /// Stops accepting new requests, shuts down every provider queue, removes
    /// all active content with delete-files semantics, and waits (bounded)
    /// for outstanding cleanup tasks before returning.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::debug!("media downloader shutting down");

        self.state
            .accepting_new
            .store(false, std::sync::atomic::Ordering::SeqCst);

        let queues: Vec<Arc<ProviderQueue>> = {
            let mut queues = self.state.queues.lock().await;
            queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.shutdown().await;
        }

        let snapshot: Vec<StopRequest> = {
            let active = self.state.active.lock().await;
            active
                .values()
                .map(|item| StopRequest {
                    provider: item.provider(),
                    id: item.id().to_string(),
                    delete_files: true,
                })
                .collect()
        };
        for request in snapshot {
            if let Err(error) = self.remove_download(request).await {
                tracing::warn!(%error, "failed to remove download during shutdown");
            }
        }

        tracing::debug!("stop requests sent out, waiting for cleanup tasks to finish");
        if tokio::time::timeout(
            self.config.cleanup_shutdown_wait,
            self.state.cleanup_tasks.wait(),
        )
        .await
        .is_err()
        {
            tracing::warn!("cleanup tasks did not finish before the shutdown deadline");
        }

        self.state.root_token.cancel();
        self.emit_event(Event::Shutdown);

        tracing::debug!("media downloader shutdown complete");
        Ok(())
    }
}
