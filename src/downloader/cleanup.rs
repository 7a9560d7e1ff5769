//! Disposing of a removed item's output
//!
//! Two paths, mirroring the two removal flavors:
//! - delete: remove every unit directory created this run, then prune
//!   now-empty directories one level under the download dir, then the
//!   download dir itself if nothing is left
//! - archive: delete replaced archives, then pack each completed unit
//!   directory into a `.cbz` and drop the directory

use super::MediaDownloader;
use crate::archive::zip_dir_to_cbz;
use crate::content::ContentItem;
use crate::types::Event;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

impl MediaDownloader {
    /// Delete all output created by this run and prune empty parents
    pub(crate) async fn delete_files(&self, item: &Arc<ContentItem>) {
        let relative = item.download_dir_rel();
        if relative.as_os_str().is_empty() {
            tracing::error!(content_id = %item.id(), "download dir is empty, not removing any files");
            return;
        }

        let dir = self.config.root_dir.join(&relative);
        let start = Instant::now();

        // A missing directory just means nothing was written yet
        match tokio::fs::try_exists(&dir).await {
            Ok(true) => {}
            _ => return,
        }

        let mut errors: Vec<String> = Vec::new();

        for path in item.new_content() {
            tracing::trace!(content_id = %item.id(), path = %path.display(), "deleting new content dir");
            if let Err(error) = tokio::fs::remove_dir_all(&path).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(
                        content_id = %item.id(),
                        path = %path.display(),
                        %error,
                        "error while removing new content dir"
                    );
                    errors.push(format!(
                        "error removing new content dir {}: {error}",
                        path.display()
                    ));
                }
            }
        }

        errors.extend(self.delete_empty_directories(item, &dir).await);
        self.notify_cleanup_errors(item, errors);

        tracing::debug!(
            content_id = %item.id(),
            dir = %dir.display(),
            elapsed = ?start.elapsed(),
            "finished removing newly downloaded files"
        );
    }

    /// Prune empty directories one level under `dir`, then `dir` itself
    async fn delete_empty_directories(&self, item: &Arc<ContentItem>, dir: &Path) -> Vec<String> {
        let mut errors = Vec::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(
                    content_id = %item.id(),
                    dir = %dir.display(),
                    %error,
                    "error while reading dir, unable to remove empty dirs"
                );
                errors.push(format!("failed to read directory {}: {error}", dir.display()));
                return errors;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(error) => {
                    errors.push(format!("failed to read directory {}: {error}", dir.display()));
                    break;
                }
            };

            let path = entry.path();
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            if !is_dir {
                continue;
            }

            match is_dir_empty(&path).await {
                Ok(true) => {
                    tracing::trace!(
                        content_id = %item.id(),
                        dir = %path.display(),
                        "dir has no content, removing"
                    );
                    if let Err(error) = tokio::fs::remove_dir(&path).await {
                        tracing::error!(
                            content_id = %item.id(),
                            dir = %path.display(),
                            %error,
                            "error while removing empty dir"
                        );
                        errors.push(format!("error removing dir {}: {error}", path.display()));
                    }
                }
                Ok(false) => {
                    tracing::trace!(
                        content_id = %item.id(),
                        dir = %path.display(),
                        "dir has content, not removing"
                    );
                }
                Err(error) => {
                    errors.push(format!("error reading dir {}: {error}", path.display()));
                }
            }
        }

        match is_dir_empty(dir).await {
            Ok(true) => {
                if let Err(error) = tokio::fs::remove_dir(dir).await {
                    tracing::error!(
                        content_id = %item.id(),
                        dir = %dir.display(),
                        %error,
                        "error while removing empty series dir"
                    );
                    errors.push(format!("error removing dir {}: {error}", dir.display()));
                }
            }
            Ok(false) => {}
            Err(error) => {
                errors.push(format!("error reading dir {}: {error}", dir.display()));
            }
        }

        errors
    }

    /// Archive the run's output: delete replaced files, zip each completed
    /// unit directory into a `.cbz`, and drop the directory
    pub(crate) async fn archive_new_content(&self, item: &Arc<ContentItem>) {
        let new_content = item.new_content();
        if new_content.is_empty() {
            return;
        }

        let start = Instant::now();
        let mut errors: Vec<String> = Vec::new();

        for path in item.to_remove_content() {
            tracing::trace!(content_id = %item.id(), path = %path.display(), "removing replaced content");
            if let Err(error) = tokio::fs::remove_file(&path).await {
                if error.kind() != std::io::ErrorKind::NotFound {
                    tracing::error!(
                        content_id = %item.id(),
                        path = %path.display(),
                        %error,
                        "error while removing replaced content"
                    );
                    errors.push(format!("error while removing old content: {error}"));
                }
            }
        }

        for dir in &new_content {
            tracing::trace!(content_id = %item.id(), dir = %dir.display(), "zipping dir");

            let zip_dir = dir.clone();
            let result =
                tokio::task::spawn_blocking(move || zip_dir_to_cbz(&zip_dir)).await;

            match result {
                Ok(Ok(_archive)) => {
                    if let Err(error) = tokio::fs::remove_dir_all(dir).await {
                        tracing::error!(
                            content_id = %item.id(),
                            dir = %dir.display(),
                            %error,
                            "error while deleting archived content directory"
                        );
                        errors.push(format!(
                            "error while deleting new content directory {}: {error}",
                            dir.display()
                        ));
                    }
                }
                Ok(Err(error)) => {
                    tracing::error!(
                        content_id = %item.id(),
                        dir = %dir.display(),
                        %error,
                        "error while zipping dir"
                    );
                    errors.push(format!("error while zipping dir {}: {error}", dir.display()));
                }
                Err(error) => {
                    errors.push(format!("archive task failed for {}: {error}", dir.display()));
                }
            }
        }

        if !errors.is_empty() {
            tracing::error!(content_id = %item.id(), ?errors, "errors encountered during cleanup");
        }
        self.notify_cleanup_errors(item, errors);

        tracing::debug!(
            content_id = %item.id(),
            size = new_content.len(),
            elapsed = ?start.elapsed(),
            "finished zipping newly downloaded content"
        );
    }

    fn notify_cleanup_errors(&self, item: &Arc<ContentItem>, errors: Vec<String>) {
        if errors.is_empty() {
            return;
        }
        self.emit_event(Event::CleanupFailed {
            id: item.id().to_string(),
            errors,
        });
    }
}

async fn is_dir_empty(dir: &Path) -> std::io::Result<bool> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    Ok(entries.next_entry().await?.is_none())
}
