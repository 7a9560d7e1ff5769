//! Removal and the observer surface

use super::MediaDownloader;
use crate::content::ContentItem;
use crate::error::{Error, Result};
use crate::types::{ContentState, DownloaderStats, Event, InfoStat, QueueStat, StopRequest};
use std::sync::Arc;

impl MediaDownloader {
    /// Stop content from being downloaded.
    ///
    /// If the id is active it is unregistered immediately and cancelled in a
    /// background task: with `delete_files` set, every file created this run
    /// is deleted and empty parents are pruned; otherwise completed unit
    /// directories are archived in place. If the id is only in the waiting
    /// list it is simply dequeued. Either way the next waiting request for
    /// the provider is admitted afterwards.
    pub async fn remove_download(&self, request: StopRequest) -> Result<()> {
        let removed = {
            let mut active = self.state.active.lock().await;
            active.remove(&request.id)
        };

        match removed {
            Some(item) => {
                tracing::info!(
                    content_id = %request.id,
                    title = %item.title(),
                    delete_files = request.delete_files,
                    "removing content"
                );

                let downloader = self.clone();
                self.state.cleanup_tasks.spawn(async move {
                    downloader.finish_removal(item, request.delete_files).await;
                    downloader.start_next(request.provider).await;
                });

                Ok(())
            }
            None => {
                let mut waiting = self.state.waiting.lock().await;
                if let Some(queue) = waiting.get_mut(&request.provider) {
                    let before = queue.len();
                    queue.retain(|stat| stat.id != request.id);
                    if queue.len() < before {
                        tracing::info!(content_id = %request.id, "removed content from waiting list");
                        self.emit_event(Event::ContentRemoved { id: request.id });
                        return Ok(());
                    }
                }
                Err(Error::NotFound(request.id))
            }
        }
    }

    /// Cancel a removed item, dispose of its output, and announce removal
    async fn finish_removal(&self, item: Arc<ContentItem>, delete_files: bool) {
        item.cancel_and_wait().await;
        item.set_state(ContentState::Cleanup);

        if delete_files {
            self.delete_files(&item).await;
        } else {
            self.log_completion(&item);
            self.archive_new_content(&item).await;
        }

        self.emit_event(Event::ContentRemoved {
            id: item.id().to_string(),
        });
    }

    /// Snapshot of one active item, if present
    pub async fn content(&self, id: &str) -> Option<InfoStat> {
        let active = self.state.active.lock().await;
        active.get(id).map(|item| item.get_info())
    }

    /// Snapshots of all active items
    pub async fn current_downloads(&self) -> Vec<InfoStat> {
        let active = self.state.active.lock().await;
        active.values().map(|item| item.get_info()).collect()
    }

    /// All requests still waiting for their provider to free up
    pub async fn queued_downloads(&self) -> Vec<QueueStat> {
        let waiting = self.state.waiting.lock().await;
        waiting.values().flatten().cloned().collect()
    }

    /// Combined running + queued view
    pub async fn stats(&self) -> DownloaderStats {
        DownloaderStats {
            running: self.current_downloads().await,
            queued: self.queued_downloads().await,
        }
    }

    /// Emit the finished notification for a completed run
    fn log_completion(&self, item: &Arc<ContentItem>) {
        let new_units = item.new_content_named();
        if new_units.is_empty() && !self.config.log_empty_downloads {
            return;
        }

        self.emit_event(Event::DownloadFinished {
            id: item.id().to_string(),
            name: item.display_name(),
            new_units,
            re_downloads: item.to_remove_content().len(),
            failed: item.failed_downloads(),
        });
    }
}
