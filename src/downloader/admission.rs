//! Request intake and per-provider admission control
//!
//! A provider is busy only while one of its items is loading or downloading;
//! requests arriving while it is busy are parked in a per-provider waiting
//! list and re-admitted FIFO when a removal frees the provider up. That
//! re-admission path is the only way deferred work ever starts.

use super::MediaDownloader;
use crate::content::ContentItem;
use crate::error::{Error, Result};
use crate::types::{DownloadRequest, Event, Provider};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl MediaDownloader {
    /// Queue content to be downloaded.
    ///
    /// Rejects duplicate ids. When the provider is busy the request is
    /// deferred into the waiting list and `Ok(())` is returned — it will be
    /// admitted automatically once the provider frees up. Otherwise the
    /// registry builds the item and metadata loading starts asynchronously.
    pub async fn download(&self, request: DownloadRequest) -> Result<()> {
        if !self.state.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let item = {
            let mut active = self.state.active.lock().await;

            if active.contains_key(&request.id) {
                return Err(Error::AlreadyExists(request.id));
            }

            if !provider_free(&active, request.provider) {
                drop(active);
                let stat = request.to_queue_stat();
                tracing::debug!(
                    content_id = %request.id,
                    provider = %request.provider,
                    "provider busy, deferring request"
                );
                self.state
                    .waiting
                    .lock()
                    .await
                    .entry(request.provider)
                    .or_default()
                    .push_back(stat.clone());
                self.emit_event(Event::ContentQueued { stat });
                return Ok(());
            }

            let repository = self.registry.create(&request)?;
            let item = ContentItem::new(
                repository,
                request.clone(),
                Arc::clone(&self.config),
                self.event_tx.clone(),
                self.command_tx.clone(),
                Arc::clone(&self.transform),
            );
            active.insert(request.id.clone(), Arc::clone(&item));
            item
        };

        self.emit_event(Event::ContentAdded {
            info: item.get_info(),
        });

        let queue = self.get_or_create_queue(request.provider).await;
        if let Err(error) = queue.add_to_loading_queue(Arc::clone(&item)) {
            // Roll the registration back; the caller sees the lane error
            self.state.active.lock().await.remove(&request.id);
            self.emit_event(Event::ContentRemoved {
                id: request.id.clone(),
            });
            return Err(error);
        }

        Ok(())
    }

    /// Whether a new request for `provider` could start right now
    pub async fn can_start(&self, provider: Provider) -> bool {
        let active = self.state.active.lock().await;
        provider_free(&active, provider)
    }

    /// Authorize a waiting item to start downloading.
    ///
    /// Moves the item `Waiting → Ready` and queues it into the provider's
    /// download lane; the queue worker promotes it from there.
    pub async fn start_download(&self, id: &str) -> Result<()> {
        let item = {
            let active = self.state.active.lock().await;
            active
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(id.to_string()))?
        };

        item.authorize_start()?;

        let queue = self.get_or_create_queue(item.provider()).await;
        queue.add_to_download_queue(item)
    }

    /// Narrow a waiting item's download to the given unit ids
    pub async fn set_selected_units(&self, id: &str, unit_ids: Vec<String>) -> Result<()> {
        let item = {
            let active = self.state.active.lock().await;
            active
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(id.to_string()))?
        };
        item.set_user_selection(unit_ids)
    }

    /// Admit the next waiting request for `provider`, if any.
    ///
    /// Walks the FIFO list until one request is accepted; rejected entries
    /// (e.g. duplicates that showed up twice) are logged and skipped.
    pub(crate) async fn start_next(&self, provider: Provider) {
        loop {
            let stat = {
                let mut waiting = self.state.waiting.lock().await;
                waiting.get_mut(&provider).and_then(|queue| queue.pop_front())
            };
            let Some(stat) = stat else { return };

            tracing::debug!(
                content_id = %stat.id,
                %provider,
                "admitting next waiting request"
            );

            match self.download(stat.to_download_request()).await {
                Ok(()) => return,
                Err(error) => {
                    tracing::warn!(
                        content_id = %stat.id,
                        %error,
                        "failed to admit queued request, trying next"
                    );
                }
            }
        }
    }

    pub(crate) async fn get_or_create_queue(
        &self,
        provider: Provider,
    ) -> Arc<super::ProviderQueue> {
        let mut queues = self.state.queues.lock().await;
        if let Some(queue) = queues.get(&provider) {
            return Arc::clone(queue);
        }

        // Defer each provider's worker task until it is first used
        let queue = Arc::new(super::ProviderQueue::new(
            provider,
            &self.state.root_token,
            &self.config,
        ));
        queues.insert(provider, Arc::clone(&queue));
        queue
    }
}

/// A provider is busy only while some item of its is loading or downloading
fn provider_free(active: &HashMap<String, Arc<ContentItem>>, provider: Provider) -> bool {
    !active
        .values()
        .any(|item| item.provider() == provider && item.state().is_active())
}
