//! Metadata loading and on-disk comparison
//!
//! `load_metadata` is the blocking first phase of an item's lifecycle: fetch
//! the series info, scan the download directory for archives that already
//! exist, and keep only the units that still need downloading. Matching an
//! on-disk file to a unit is generic (by name, then by volume + chapter);
//! whether a matched file's volume *grouping* still agrees with the source is
//! provider-specific and asked through the repository.

use super::{lock, read, write, ContentItem, RunHandles};
use crate::error::{Error, Result};
use crate::provider::{OnDiskUnit, Unit};
use crate::types::{ContentState, Event};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

impl ContentItem {
    /// Load series metadata and decide what needs downloading.
    ///
    /// Blocks until complete or cancelled. Transitions to `Ready` when the
    /// request asked to start immediately and at least one unit is pending,
    /// `Waiting` otherwise. On failure the item requests its own removal —
    /// no partial state stays registered.
    ///
    /// Calling this while the item is already loading or downloading is a
    /// logged no-op.
    pub(crate) async fn load_metadata(&self, parent: &CancellationToken) {
        {
            let mut run = lock(&self.run);
            if run.is_some() {
                tracing::warn!(
                    content_id = %self.id(),
                    "content is already loading info, or downloading"
                );
                return;
            }
            *run = Some(RunHandles::new(parent.child_token()));
        }

        let token = match lock(&self.run).as_ref() {
            Some(run) => run.token.clone(),
            None => return,
        };

        tracing::debug!(content_id = %self.id(), "loading content info");
        self.set_state(ContentState::Loading);

        let start = Instant::now();

        let series = tokio::select! {
            biased;
            _ = token.cancelled() => {
                self.request_stop(false);
                return;
            }
            result = self.repository.series_info(&self.request.id, &self.request) => {
                match result {
                    Ok(series) => series,
                    Err(error) => {
                        tracing::error!(
                            content_id = %self.id(),
                            %error,
                            "failed to load series info"
                        );
                        self.request_stop(false);
                        return;
                    }
                }
            }
        };

        if series.title.is_empty() {
            tracing::error!(content_id = %self.id(), "no title found in series info");
            self.request_stop(false);
            return;
        }

        let all_units = series.units.len();
        *write(&self.series) = Some(series);

        let scan_start = Instant::now();
        match self.filter_already_downloaded(&token).await {
            Ok(()) => {}
            Err(error) => {
                if !error.is_cancellation() {
                    tracing::warn!(content_id = %self.id(), %error, "on-disk check failed");
                }
                self.request_stop(false);
                return;
            }
        }

        let scan_elapsed = scan_start.elapsed();
        if scan_elapsed > Duration::from_secs(5) {
            tracing::warn!(
                content_id = %self.id(),
                elapsed = ?scan_elapsed,
                "checking which content must be downloaded took a long time"
            );
        }

        let pending = lock(&self.to_download).len();

        if pending == 0 && self.request.start_immediately {
            tracing::debug!(content_id = %self.id(), "no units found to download, stopping");
            self.set_state(ContentState::Waiting);
            self.request_stop(false);
            return;
        }

        self.set_state(if self.request.start_immediately {
            ContentState::Ready
        } else {
            ContentState::Waiting
        });
        self.emit(Event::SizeChanged {
            id: self.id().to_string(),
            size: self.size_label(),
        });

        tracing::debug!(
            content_id = %self.id(),
            title = %self.title(),
            all = all_units,
            to_download = pending,
            duration = ?start.elapsed(),
            "loaded content info"
        );
    }

    /// Scan the download directory and keep only the units that still need
    /// downloading
    async fn filter_already_downloaded(&self, token: &CancellationToken) -> Result<()> {
        let existing = self.scan_on_disk(token).await?;
        *lock(&self.existing) = existing;

        let units: Vec<Unit> = read(&self.series)
            .as_ref()
            .map(|s| s.units.clone())
            .unwrap_or_default();

        let pending: Vec<Unit> = units
            .into_iter()
            .filter(|unit| self.should_download(unit))
            .collect();

        *lock(&self.to_download) = pending;
        Ok(())
    }

    /// Recursively collect on-disk archives the provider recognizes as its
    /// content.
    ///
    /// Checks the cancellation token once per directory entry; at most one
    /// more file is examined after cancellation.
    async fn scan_on_disk(&self, token: &CancellationToken) -> Result<Vec<OnDiskUnit>> {
        let relative = self.download_dir_rel();
        let root = self.config.root_dir.join(&relative);
        tracing::debug!(content_id = %self.id(), dir = %root.display(), "checking content on disk");

        let mut found = Vec::new();
        let mut stack: Vec<(PathBuf, PathBuf)> = vec![(root.clone(), relative)];

        while let Some((dir, rel_dir)) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                    if dir == root {
                        tracing::trace!(content_id = %self.id(), "download directory not found, fresh download");
                        return Ok(Vec::new());
                    }
                    continue;
                }
                Err(error) => {
                    tracing::warn!(
                        content_id = %self.id(),
                        %error,
                        "failed to read download directory, downloading everything"
                    );
                    return Ok(Vec::new());
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                if token.is_cancelled() {
                    return Err(Error::Cancelled);
                }

                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                let rel_path = rel_dir.join(&name);

                if entry.file_type().await?.is_dir() {
                    stack.push((path, rel_path));
                    continue;
                }

                match self.repository.parse_on_disk(&name) {
                    Some(parsed) => {
                        tracing::trace!(content_id = %self.id(), file = %name, "found content on disk");
                        found.push(OnDiskUnit {
                            name,
                            path: rel_path.to_string_lossy().into_owned(),
                            volume: parsed.volume,
                            chapter: parsed.chapter,
                        });
                    }
                    None => {
                        tracing::trace!(content_id = %self.id(), file = %name, "skipping non-content file");
                    }
                }
            }
        }

        Ok(found)
    }

    /// Whether a unit still needs downloading, given what is already on disk.
    ///
    /// May queue the matched on-disk archive for removal when the provider
    /// reports its volume grouping changed upstream.
    pub(crate) fn should_download(&self, unit: &Unit) -> bool {
        let existing = lock(&self.existing);

        // A whole-volume archive covering this unit counts as downloaded
        if !unit.volume.is_empty()
            && find_by_name(&existing, &self.volume_dir_name(unit)).is_some()
        {
            return false;
        }

        let matched = find_by_name(&existing, &self.unit_file_name(unit))
            .or_else(|| find_by_volume_and_chapter(&existing, &unit.volume, &unit.chapter));

        let Some(matched) = matched else {
            return true;
        };

        let on_disk_volume = match self.repository.volume_on_disk(matched) {
            Ok(volume) => volume,
            Err(error) => {
                tracing::warn!(
                    content_id = %self.id(),
                    path = %matched.path,
                    %error,
                    "failed to retrieve volume on disk"
                );
                return false;
            }
        };

        if let Some(on_disk_volume) = on_disk_volume {
            if !unit.volume.is_empty() && on_disk_volume != unit.volume {
                tracing::debug!(
                    content_id = %self.id(),
                    on_disk_volume = %on_disk_volume,
                    volume = %unit.volume,
                    "volume grouping changed, redownloading content"
                );
                let absolute = self.config.root_dir.join(&matched.path);
                drop(existing);
                lock(&self.to_remove).push(absolute);
                return true;
            }
        }

        false
    }
}

/// Find an on-disk archive by file name, ignoring the extension
fn find_by_name<'a>(existing: &'a [OnDiskUnit], name: &str) -> Option<&'a OnDiskUnit> {
    existing.iter().find(|content| {
        Path::new(&content.name)
            .file_stem()
            .map(|stem| stem.to_string_lossy() == name)
            .unwrap_or(false)
    })
}

/// Find an on-disk archive by its parsed volume and chapter markers.
///
/// Tolerates volume drift in both directions: a file without a volume still
/// matches a unit that has one, and a file with a volume matches a unit that
/// lost its volume upstream.
fn find_by_volume_and_chapter<'a>(
    existing: &'a [OnDiskUnit],
    volume: &str,
    chapter: &str,
) -> Option<&'a OnDiskUnit> {
    if chapter.is_empty() {
        return None;
    }

    existing.iter().find(|content| {
        if content.chapter != chapter {
            return false;
        }
        content.volume == volume || content.volume.is_empty() || volume.is_empty()
    })
}
