//! Per-unit download pipeline
//!
//! `download_content` walks the pending units strictly one at a time; each
//! unit runs its own producer/worker pipeline:
//!
//! 1. A producer emits `(index, url)` descriptors into a channel sized to
//!    the worker pool width, stopping early on cancellation.
//! 2. A fixed pool of workers drains it under a shared token-bucket request
//!    limiter, so throughput is bounded regardless of worker count.
//! 3. First-time failures are deferred to a per-worker retry list; a second
//!    failure is fatal for the unit and cancels the unit's own scope.
//! 4. Successful payloads go to the item-level I/O stage, which outlives
//!    the unit pipelines and drains before the item enters `Cleanup`.

use super::io::IoTask;
use super::{lock, read, write, ContentItem, RunHandles};
use crate::error::{Error, ProviderError};
use crate::provider::Unit;
use crate::rate_limiter::RequestLimiter;
use crate::speed_tracker::SpeedTracker;
use crate::types::{ContentState, Event};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// One sub-resource (page/image) to fetch, scoped to a single pipeline run
#[derive(Clone, Debug)]
struct SubUnitTask {
    /// 1-based position within the unit
    index: usize,
    /// Source locator
    url: String,
}

impl ContentItem {
    /// Download every pending unit, then archive and request removal.
    ///
    /// Blocks until complete, aborted or cancelled. Only valid from `Ready`
    /// or `Waiting`; any other state is a logged no-op.
    pub(crate) async fn download_content(self: &Arc<Self>, parent: &CancellationToken) {
        match self.state() {
            ContentState::Ready | ContentState::Waiting => {}
            state => {
                tracing::warn!(
                    content_id = %self.id(),
                    %state,
                    "cannot start downloading in this state"
                );
                return;
            }
        }

        self.set_state(ContentState::Downloading);

        let run = RunHandles::new(parent.child_token());
        *lock(&self.run) = Some(run.clone());

        self.filter_user_selection();
        let units = lock(&self.to_download).clone();
        let all = read(&self.series)
            .as_ref()
            .map(|s| s.units.len())
            .unwrap_or_default();

        tracing::info!(
            content_id = %self.id(),
            all,
            to_download = units.len(),
            re_downloads = lock(&self.to_remove).len(),
            into = %self.download_dir_rel().display(),
            "downloading content"
        );

        *write(&self.speed) = Arc::new(SpeedTracker::new(units.len()));

        let io_capacity = self.max_images * self.config.io_queue_factor;
        let (io_tx, io_rx) = mpsc::channel::<IoTask>(io_capacity);
        self.spawn_io_workers(&run, io_rx);
        self.spawn_progress_reporter(&run);

        let start = Instant::now();
        let mut failure: Option<Error> = None;

        for unit in &units {
            if run.token.is_cancelled() {
                failure = Some(Error::Cancelled);
                break;
            }
            if let Err(error) = self.download_unit(unit, &run, &io_tx).await {
                failure = Some(error);
                break;
            }
        }

        // No more sends: lets the I/O workers drain and exit
        drop(io_tx);

        match failure {
            None => {
                tracing::debug!(
                    content_id = %self.id(),
                    elapsed = ?start.elapsed(),
                    "all units downloaded, waiting for I/O workers to finish"
                );
                self.set_state(ContentState::Cleanup);
                run.io_tasks.wait().await;

                let io_failure = lock(&self.io_failure).take();
                if let Some(message) = io_failure {
                    self.abort_download(Error::Other(message)).await;
                    return;
                }

                tracing::info!(
                    content_id = %self.id(),
                    elapsed = ?start.elapsed(),
                    "finished downloading content"
                );
                self.request_stop(false);
            }
            Some(error) => {
                tracing::trace!(content_id = %self.id(), %error, "download failed");
                let _ = tokio::time::timeout(self.config.abort_wait, run.io_tasks.wait()).await;

                // An I/O failure cancels the run token; prefer it over the
                // resulting Cancelled error so the real reason surfaces
                let reason = match lock(&self.io_failure).take() {
                    Some(message) => Error::Other(message),
                    None => error,
                };
                self.abort_download(reason).await;
            }
        }
    }

    /// The one abort path: cancel descendants, wait bounded, notify, and
    /// request removal with delete-files semantics.
    ///
    /// Cancellation is not an abort — the canceller owns removal.
    pub(crate) async fn abort_download(&self, reason: Error) {
        if reason.is_cancellation() {
            return;
        }

        tracing::error!(content_id = %self.id(), error = %reason, "error while downloading content");

        let run = lock(&self.run).clone();
        if let Some(run) = run {
            run.token.cancel();
            let wait = self.config.abort_wait;
            if tokio::time::timeout(wait, run.download_tasks.wait())
                .await
                .is_err()
            {
                tracing::warn!(content_id = %self.id(), "download tasks did not drain in time");
            }
            if tokio::time::timeout(wait, run.io_tasks.wait()).await.is_err() {
                tracing::warn!(content_id = %self.id(), "I/O tasks did not drain in time");
            }
        }

        let name = self.display_name();
        self.emit(Event::DownloadFailed {
            id: self.id().to_string(),
            name: name.clone(),
            error: format!("Download failed for {name}, because {reason}"),
        });

        self.request_stop(true);
    }

    /// Drop units outside the user's selection, and the matching stale
    /// archive removals with them
    fn filter_user_selection(&self) {
        let selected = lock(&self.user_selected).clone();
        if selected.is_empty() {
            return;
        }

        let kept: Vec<PathBuf>;
        {
            let mut to_download = lock(&self.to_download);
            let before = to_download.len();
            to_download.retain(|unit| selected.contains(&unit.id));
            tracing::debug!(
                content_id = %self.id(),
                size = before,
                new_size = to_download.len(),
                "content further filtered by user selection"
            );

            kept = to_download
                .iter()
                .map(|unit| self.unit_dir_abs(unit).with_extension("cbz"))
                .collect();
        }

        let mut to_remove = lock(&self.to_remove);
        if !to_remove.is_empty() {
            to_remove.retain(|path| kept.contains(path));
        }
    }

    /// Download all sub-units of one unit through the worker pipeline
    async fn download_unit(
        self: &Arc<Self>,
        unit: &Unit,
        run: &RunHandles,
        io_tx: &mpsc::Sender<IoTask>,
    ) -> crate::error::Result<()> {
        let urls = tokio::select! {
            biased;
            _ = run.token.cancelled() => return Err(Error::Cancelled),
            result = self.repository.unit_resources(unit) => result?,
        };

        if urls.is_empty() {
            tracing::warn!(
                content_id = %self.id(),
                unit = %unit.label(),
                "unit has no downloadable resources, skipping"
            );
            return Ok(());
        }

        let dir = self.unit_dir_abs(unit);
        tokio::fs::create_dir_all(&dir).await?;
        // Recorded before any page lands so an abort can clean the directory
        lock(&self.has_downloaded).push(dir.clone());

        if let Err(error) = self.repository.write_unit_metadata(unit, &dir).await {
            tracing::warn!(content_id = %self.id(), %error, "failed to write unit metadata");
        }

        tracing::debug!(
            content_id = %self.id(),
            unit = %unit.label(),
            size = urls.len(),
            "starting unit download"
        );
        let start = Instant::now();

        let tracker = read(&self.speed).clone();
        tracker.set_intermediate(urls.len());

        // Child scope: a fatal retry failure stops this unit's siblings
        // without touching other units or the item itself
        let token = run.token.child_token();
        let limiter = RequestLimiter::new(Some(self.config.effective_images_per_second()));
        let (task_tx, task_rx) = mpsc::channel::<SubUnitTask>(self.max_images);
        let task_rx = Arc::new(AsyncMutex::new(task_rx));
        let (error_tx, mut error_rx) = mpsc::channel::<Error>(1);

        let producer = {
            let token = token.clone();
            let urls = urls.clone();
            run.download_tasks.spawn(async move {
                for (position, url) in urls.into_iter().enumerate() {
                    let task = SubUnitTask {
                        index: position + 1,
                        url,
                    };
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return,
                        result = task_tx.send(task) => {
                            if result.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(self.max_images);
        for worker_id in 0..self.max_images {
            let env = WorkerEnv {
                item: Arc::clone(self),
                unit: unit.clone(),
                dir: dir.clone(),
                token: token.clone(),
                limiter: limiter.clone(),
                tasks: Arc::clone(&task_rx),
                io_tx: io_tx.clone(),
                errors: error_tx.clone(),
                tracker: Arc::clone(&tracker),
                worker_id,
            };
            workers.push(run.download_tasks.spawn(pipeline_worker(env)));
        }
        drop(error_tx);

        futures::future::join_all(workers).await;
        producer.await.ok();

        tracing::debug!(
            content_id = %self.id(),
            unit = %unit.label(),
            elapsed = ?start.elapsed(),
            "finished unit download"
        );

        if let Ok(error) = error_rx.try_recv() {
            return Err(error);
        }
        if run.token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        // Courtesy pause after tiny units so rapid-fire unit turnover does
        // not hammer the provider
        if urls.len() < self.config.small_unit_threshold {
            tokio::select! {
                biased;
                _ = run.token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.small_unit_delay) => {}
            }
        }

        tracker.clear_intermediate();
        tracker.increment();
        self.emit_progress();
        Ok(())
    }

    fn spawn_progress_reporter(self: &Arc<Self>, run: &RunHandles) {
        let item = Arc::clone(self);
        let token = run.token.clone();
        let interval = self.config.progress_interval;

        run.download_tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // interval fires immediately; skip that first tick
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = ticker.tick() => item.emit_progress(),
                }
            }
        });
    }
}

/// Everything one pipeline worker needs, bundled for the spawn
struct WorkerEnv {
    item: Arc<ContentItem>,
    unit: Unit,
    dir: PathBuf,
    token: CancellationToken,
    limiter: RequestLimiter,
    tasks: Arc<AsyncMutex<mpsc::Receiver<SubUnitTask>>>,
    io_tx: mpsc::Sender<IoTask>,
    errors: mpsc::Sender<Error>,
    tracker: Arc<SpeedTracker>,
    worker_id: usize,
}

/// One download worker: drain the primary pass, then retry this worker's
/// failed tasks once. A retry failure is fatal for the unit.
async fn pipeline_worker(env: WorkerEnv) {
    let mut failed: Vec<SubUnitTask> = Vec::new();

    loop {
        let task = {
            let mut tasks = env.tasks.lock().await;
            tokio::select! {
                biased;
                _ = env.token.cancelled() => return,
                task = tasks.recv() => task,
            }
        };
        let Some(task) = task else { break };

        if !process_task(&env, task, false, &mut failed).await {
            return;
        }
    }

    if failed.is_empty() {
        return;
    }

    tracing::debug!(
        content_id = %env.item.id(),
        worker = env.worker_id,
        failed = failed.len(),
        "some sub-units failed, retrying"
    );

    for task in std::mem::take(&mut failed) {
        if !process_task(&env, task, true, &mut failed).await {
            return;
        }
    }
}

/// Fetch one sub-unit and forward it to the I/O stage.
///
/// Returns `false` when the worker should stop (cancellation or fatal retry
/// failure). First-pass failures are recorded into `failed` for the retry
/// pass instead of aborting.
async fn process_task(
    env: &WorkerEnv,
    task: SubUnitTask,
    is_retry: bool,
    failed: &mut Vec<SubUnitTask>,
) -> bool {
    tokio::select! {
        biased;
        _ = env.token.cancelled() => return false,
        _ = env.limiter.acquire() => {}
    }

    tracing::trace!(
        content_id = %env.item.id(),
        worker = env.worker_id,
        idx = task.index,
        url = %task.url,
        "downloading sub-unit"
    );

    let result = tokio::select! {
        biased;
        _ = env.token.cancelled() => return false,
        result = env.item.repository.fetch_sub_unit(task.index, &env.unit, &task.url) => result,
    };

    match result {
        Ok(data) => {
            if env.token.is_cancelled() {
                // Parent already cancelled — discard silently rather than
                // surfacing a write into a torn-down stage
                return false;
            }

            env.item.images_downloaded.fetch_add(1, Ordering::Relaxed);
            env.tracker.increment_intermediate();

            let io_task = IoTask {
                data,
                dir: env.dir.clone(),
                index: task.index,
                url: task.url,
            };
            tokio::select! {
                biased;
                _ = env.token.cancelled() => false,
                result = env.io_tx.send(io_task) => result.is_ok(),
            }
        }
        Err(error) => {
            if env.token.is_cancelled() {
                return false;
            }

            if is_retry {
                on_retry_failure(env, task, error);
                return false;
            }

            env.item.failed_downloads.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                content_id = %env.item.id(),
                idx = task.index,
                url = %task.url,
                %error,
                "sub-unit download failed for the first time, retrying at the end"
            );
            failed.push(task);
            true
        }
    }
}

/// A failure on the retry pass ends the unit: first failure wins the error
/// slot, later ones are logged and dropped, and the unit scope is cancelled.
fn on_retry_failure(env: &WorkerEnv, task: SubUnitTask, error: ProviderError) {
    tracing::error!(
        content_id = %env.item.id(),
        idx = task.index,
        url = %task.url,
        %error,
        "retry download failed, ending unit download"
    );

    let fatal = Error::SubUnitFailed {
        url: task.url,
        source: error,
    };

    match env.errors.try_send(fatal) {
        Ok(()) => env.token.cancel(),
        Err(mpsc::error::TrySendError::Full(superseded)) => {
            tracing::warn!(
                content_id = %env.item.id(),
                error = %superseded,
                "fatal error already recorded, dropping superseded failure"
            );
        }
        Err(mpsc::error::TrySendError::Closed(superseded)) => {
            tracing::warn!(
                content_id = %env.item.id(),
                error = %superseded,
                "error channel closed, dropping failure"
            );
        }
    }
}
