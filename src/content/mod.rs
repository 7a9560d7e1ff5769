//! Content item state machine
//!
//! A [`ContentItem`] owns one requested piece of content for its whole
//! lifetime: metadata loading, the decision of which units still need
//! downloading, the per-unit download pipeline, and the bookkeeping external
//! observers read. Items are owned by the client's active map and driven by
//! their provider queue's single worker; they talk back to the client only
//! through a command channel, never through a handle.
//!
//! Submodules:
//! - [`metadata`] - metadata loading and on-disk comparison
//! - [`naming`] - directory and file name layout
//! - [`pipeline`] - the per-unit producer/worker/retry pipeline
//! - [`io`] - the bounded I/O stage

mod io;
mod metadata;
mod naming;
mod pipeline;

use crate::config::Config;
use crate::downloader::ClientCommand;
use crate::provider::{OnDiskUnit, Repository, SeriesInfo, Unit};
use crate::speed_tracker::SpeedTracker;
use crate::transform::Transform;
use crate::types::{ContentState, DownloadRequest, Event, InfoStat, SpeedType, StopRequest};

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Lock a std mutex, recovering from poisoning instead of panicking
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Read-lock a std rwlock, recovering from poisoning instead of panicking
pub(crate) fn read<T>(rwlock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Write-lock a std rwlock, recovering from poisoning instead of panicking
pub(crate) fn write<T>(rwlock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Cancellation scope and task trackers for one load or download run
#[derive(Clone)]
pub(crate) struct RunHandles {
    /// Cancellation token for this run; every pipeline derives children from it
    pub(crate) token: CancellationToken,
    /// Producer, download workers and progress reporter
    pub(crate) download_tasks: TaskTracker,
    /// I/O stage workers
    pub(crate) io_tasks: TaskTracker,
    /// When the run started, for speed calculations
    pub(crate) started: Instant,
}

impl RunHandles {
    pub(crate) fn new(token: CancellationToken) -> Self {
        let download_tasks = TaskTracker::new();
        let io_tasks = TaskTracker::new();
        // Closed up front: the trackers only gate `wait()`, tasks can still
        // be spawned through them afterwards
        download_tasks.close();
        io_tasks.close();
        Self {
            token,
            download_tasks,
            io_tasks,
            started: Instant::now(),
        }
    }
}

/// One user-requested piece of content, tracked as a single state machine
pub struct ContentItem {
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) request: DownloadRequest,
    pub(crate) config: Arc<Config>,
    pub(crate) max_images: usize,
    pub(crate) transform: Arc<dyn Transform>,

    events: broadcast::Sender<Event>,
    commands: mpsc::UnboundedSender<ClientCommand>,

    state: RwLock<ContentState>,
    pub(crate) series: RwLock<Option<SeriesInfo>>,
    include_volume: OnceLock<bool>,

    /// Units selected for download this run
    pub(crate) to_download: Mutex<Vec<Unit>>,
    /// Unit ids the user narrowed the download to
    pub(crate) user_selected: Mutex<Vec<String>>,
    /// Archives found on disk before the download started
    pub(crate) existing: Mutex<Vec<OnDiskUnit>>,
    /// Absolute paths of unit directories created this run
    pub(crate) has_downloaded: Mutex<Vec<PathBuf>>,
    /// Absolute paths of replaced archives to delete during cleanup
    pub(crate) to_remove: Mutex<Vec<PathBuf>>,

    pub(crate) images_downloaded: AtomicU64,
    pub(crate) failed_downloads: AtomicU64,
    pub(crate) speed: RwLock<Arc<SpeedTracker>>,
    /// First I/O stage failure, checked after the stage drains
    pub(crate) io_failure: Mutex<Option<String>>,
    pub(crate) run: Mutex<Option<RunHandles>>,
}

impl ContentItem {
    pub(crate) fn new(
        repository: Arc<dyn Repository>,
        request: DownloadRequest,
        config: Arc<Config>,
        events: broadcast::Sender<Event>,
        commands: mpsc::UnboundedSender<ClientCommand>,
        transform: Arc<dyn Transform>,
    ) -> Arc<Self> {
        let max_images = config.worker_pool_width();
        Arc::new(Self {
            repository,
            request,
            config,
            max_images,
            transform,
            events,
            commands,
            state: RwLock::new(ContentState::Queued),
            series: RwLock::new(None),
            include_volume: OnceLock::new(),
            to_download: Mutex::new(Vec::new()),
            user_selected: Mutex::new(Vec::new()),
            existing: Mutex::new(Vec::new()),
            has_downloaded: Mutex::new(Vec::new()),
            to_remove: Mutex::new(Vec::new()),
            images_downloaded: AtomicU64::new(0),
            failed_downloads: AtomicU64::new(0),
            speed: RwLock::new(Arc::new(SpeedTracker::new(0))),
            io_failure: Mutex::new(None),
            run: Mutex::new(None),
        })
    }

    /// Content id (provider-scoped, the active-map key)
    pub fn id(&self) -> &str {
        &self.request.id
    }

    /// Provider hosting this content
    pub fn provider(&self) -> crate::types::Provider {
        self.request.provider
    }

    /// The original request this item was created from
    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContentState {
        *read(&self.state)
    }

    /// Number of sub-unit downloads that failed at least once
    pub fn failed_downloads(&self) -> u64 {
        self.failed_downloads.load(Ordering::Relaxed)
    }

    /// Total number of sub-units downloaded so far
    pub fn images_downloaded(&self) -> u64 {
        self.images_downloaded.load(Ordering::Relaxed)
    }

    /// Transition to `to`, enforcing the lifecycle table.
    ///
    /// Invalid transitions are logged and ignored rather than applied; this
    /// is the single place state is ever mutated.
    pub(crate) fn set_state(&self, to: ContentState) {
        {
            let mut state = write(&self.state);
            if *state == to {
                return;
            }
            if !transition_allowed(*state, to) {
                tracing::warn!(
                    content_id = %self.id(),
                    from = %*state,
                    to = %to,
                    "ignoring invalid state transition"
                );
                return;
            }
            *state = to;
        }
        self.emit(Event::StateChanged {
            id: self.id().to_string(),
            state: to,
        });
    }

    /// Authorize a waiting item to start downloading (`Waiting → Ready`)
    pub(crate) fn authorize_start(&self) -> crate::error::Result<()> {
        match self.state() {
            ContentState::Ready => Ok(()),
            ContentState::Waiting => {
                self.set_state(ContentState::Ready);
                Ok(())
            }
            other => Err(crate::error::Error::InvalidState {
                id: self.id().to_string(),
                operation: "start".to_string(),
                current_state: other.to_string(),
            }),
        }
    }

    /// Narrow the download to the given unit ids.
    ///
    /// Only valid while the item is waiting or ready; an empty list restores
    /// the full selection.
    pub(crate) fn set_user_selection(&self, ids: Vec<String>) -> crate::error::Result<()> {
        match self.state() {
            ContentState::Waiting | ContentState::Ready => {
                *lock(&self.user_selected) = ids;
                self.emit(Event::SizeChanged {
                    id: self.id().to_string(),
                    size: self.size_label(),
                });
                Ok(())
            }
            other => Err(crate::error::Error::InvalidState {
                id: self.id().to_string(),
                operation: "select".to_string(),
                current_state: other.to_string(),
            }),
        }
    }

    /// Number of units this run will download, honoring the user selection
    pub(crate) fn size(&self) -> usize {
        let selected = lock(&self.user_selected).len();
        if selected > 0 {
            selected
        } else {
            lock(&self.to_download).len()
        }
    }

    pub(crate) fn size_label(&self) -> String {
        format!("{} units", self.size())
    }

    /// Display name shown in notifications and snapshots
    pub fn display_name(&self) -> String {
        self.title()
    }

    /// Absolute paths of unit directories created this run
    pub fn new_content(&self) -> Vec<PathBuf> {
        lock(&self.has_downloaded).clone()
    }

    /// Labels of the units downloaded this run
    pub fn new_content_named(&self) -> Vec<String> {
        lock(&self.to_download).iter().map(Unit::label).collect()
    }

    /// Absolute paths of replaced archives to delete during cleanup
    pub fn to_remove_content(&self) -> Vec<PathBuf> {
        lock(&self.to_remove).clone()
    }

    /// Snapshot for external observers
    pub fn get_info(&self) -> InfoStat {
        let state = self.state();
        let tracker = read(&self.speed).clone();
        let ref_url = read(&self.series)
            .as_ref()
            .map(|s| s.ref_url.clone())
            .unwrap_or_default();

        InfoStat {
            provider: self.provider(),
            id: self.id().to_string(),
            state,
            name: self.title(),
            ref_url,
            size: self.size_label(),
            downloading: state == ContentState::Downloading,
            progress: tracker.progress(),
            estimated: tracker.eta_seconds(),
            speed_type: SpeedType::Images,
            speed: self.image_speed(),
            download_dir: self.download_dir_rel().to_string_lossy().into_owned(),
        }
    }

    /// Sub-units per second over the current run, 0 outside `Downloading`
    pub(crate) fn image_speed(&self) -> f64 {
        if self.state() != ContentState::Downloading {
            return 0.0;
        }
        let started = match lock(&self.run).as_ref() {
            Some(run) => run.started,
            None => return 0.0,
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.images_downloaded() as f64 / elapsed
    }

    /// Cancel any in-flight load or download and wait, bounded per phase,
    /// for the workers to observe the signal and exit.
    ///
    /// Does not request removal — the caller owns that decision.
    pub(crate) async fn cancel_and_wait(&self) {
        tracing::trace!(content_id = %self.id(), "cancelling content");

        let run = lock(&self.run).clone();
        let Some(run) = run else { return };

        run.token.cancel();

        let wait = self.config.cancel_wait;
        tracing::debug!(content_id = %self.id(), ?wait, "waiting for download tasks to stop");
        if tokio::time::timeout(wait, run.download_tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(content_id = %self.id(), "download tasks did not stop in time");
        }
        if tokio::time::timeout(wait, run.io_tasks.wait()).await.is_err() {
            tracing::warn!(content_id = %self.id(), "I/O tasks did not stop in time");
        }
    }

    /// Ask the client to remove this item from the active set
    pub(crate) fn request_stop(&self, delete_files: bool) {
        let request = StopRequest {
            provider: self.provider(),
            id: self.id().to_string(),
            delete_files,
        };
        if self
            .commands
            .send(ClientCommand::Remove(request))
            .is_err()
        {
            tracing::warn!(
                content_id = %self.id(),
                "client command channel closed, cannot request removal"
            );
        }
    }

    pub(crate) fn emit(&self, event: Event) {
        // send() fails when no one is subscribed, which is fine
        self.events.send(event).ok();
    }

    pub(crate) fn emit_progress(&self) {
        let tracker = read(&self.speed).clone();
        self.emit(Event::Progress {
            id: self.id().to_string(),
            progress: tracker.progress(),
            speed_type: SpeedType::Images,
            speed: self.image_speed(),
        });
    }

    pub(crate) fn should_include_volume(&self) -> bool {
        *self.include_volume.get_or_init(|| {
            let series = read(&self.series);
            let Some(series) = series.as_ref() else {
                return false;
            };
            // A chapter number reused across volumes forces the volume
            // marker into file names to keep them unique
            let mut seen: std::collections::HashMap<&str, &str> = std::collections::HashMap::new();
            for unit in &series.units {
                if unit.chapter.is_empty() {
                    continue;
                }
                if let Some(previous) = seen.insert(unit.chapter.as_str(), unit.volume.as_str()) {
                    if previous != unit.volume {
                        return true;
                    }
                }
            }
            false
        })
    }
}

/// The lifecycle transition table.
///
/// `Cleanup` is reachable from every state because removal can interrupt any
/// phase; everything else follows the ordered lifecycle.
fn transition_allowed(from: ContentState, to: ContentState) -> bool {
    use ContentState::*;
    matches!(
        (from, to),
        (Queued, Loading)
            | (Loading, Ready)
            | (Loading, Waiting)
            | (Waiting, Ready)
            | (Waiting, Downloading)
            | (Ready, Downloading)
            | (_, Cleanup)
    )
}
