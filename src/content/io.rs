//! The bounded I/O stage
//!
//! Download workers hand payloads to this stage through a channel sized to
//! twice the worker pool width, decoupling network fetches from disk writes.
//! The stage spans the whole item download: it is only closed once every
//! unit has completed, and fully drains before the item declares `Cleanup`.
//! A write failure aborts the entire item — a torn partial write would
//! corrupt the final archive.

use super::{lock, ContentItem, RunHandles};
use crate::transform::url_extension;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

/// A downloaded payload waiting for its disk write
pub(crate) struct IoTask {
    /// Raw payload from the provider
    pub(crate) data: Vec<u8>,
    /// Absolute unit directory the page belongs to
    pub(crate) dir: PathBuf,
    /// 1-based page index within the unit
    pub(crate) index: usize,
    /// Source locator, for the fallback file extension
    pub(crate) url: String,
}

impl ContentItem {
    /// Start the I/O worker pool for one download run
    pub(crate) fn spawn_io_workers(
        self: &Arc<Self>,
        run: &RunHandles,
        receiver: mpsc::Receiver<IoTask>,
    ) {
        let worker_count = self.max_images * self.config.io_queue_factor;
        let receiver = Arc::new(AsyncMutex::new(receiver));

        for worker_id in 0..worker_count {
            let item = Arc::clone(self);
            let receiver = Arc::clone(&receiver);
            let token = run.token.clone();
            run.io_tasks
                .spawn(async move { item.io_worker(worker_id, receiver, token).await });
        }
    }

    /// One I/O worker: transform and write payloads until the channel closes
    /// or the run is cancelled
    async fn io_worker(
        &self,
        worker_id: usize,
        receiver: Arc<AsyncMutex<mpsc::Receiver<IoTask>>>,
        token: CancellationToken,
    ) {
        loop {
            let task = {
                let mut receiver = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    task = receiver.recv() => task,
                }
            };
            let Some(task) = task else { return };

            if token.is_cancelled() {
                return;
            }

            let source_ext = url_extension(&task.url);
            let (data, ext) = self.transform.apply(task.data, source_ext);
            let path = task.dir.join(format!("page {:04}.{ext}", task.index));

            if token.is_cancelled() {
                return;
            }

            if let Err(error) = tokio::fs::write(&path, &data).await {
                if token.is_cancelled() {
                    tracing::debug!(
                        content_id = %self.id(),
                        worker = worker_id,
                        %error,
                        "ignoring write error due to cancellation"
                    );
                    return;
                }

                tracing::error!(
                    content_id = %self.id(),
                    worker = worker_id,
                    path = %path.display(),
                    %error,
                    "error writing file"
                );

                // First failure wins; the run token tears the item down and
                // the pipeline surfaces the recorded reason
                let mut failure = lock(&self.io_failure);
                if failure.is_none() {
                    *failure = Some(format!("error writing file {}: {error}", path.display()));
                }
                drop(failure);

                token.cancel();
                return;
            }

            tracing::trace!(
                content_id = %self.id(),
                worker = worker_id,
                path = %path.display(),
                "wrote sub-unit"
            );
        }
    }
}
