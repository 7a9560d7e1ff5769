//! Provider adapter contract
//!
//! Every provider (manga site, webtoon site, tracker) plugs into the core
//! through the narrow [`Repository`] trait: fetch series metadata, list a
//! unit's sub-resource URLs, fetch one sub-unit payload, and answer the
//! provider-specific "is this file ours / which volume grouping is it in"
//! questions the on-disk comparison needs. Scraping, parsing and HTTP live
//! entirely behind this boundary.

use crate::error::ProviderError;
use crate::types::{DownloadRequest, Provider};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Publication status of a series
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesStatus {
    /// Still releasing
    #[default]
    Ongoing,
    /// Finished
    Completed,
    /// Hiatus or pending
    Paused,
    /// Dropped by the source
    Cancelled,
}

/// Series metadata returned by [`Repository::series_info`]
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SeriesInfo {
    /// Provider-scoped series id
    pub id: String,
    /// Series title; must be non-empty
    pub title: String,
    /// Canonical URL of the series on the provider's site
    pub ref_url: String,
    /// Long-form description, if the provider has one
    #[serde(default)]
    pub description: String,
    /// Publication status
    #[serde(default)]
    pub status: SeriesStatus,
    /// All known units (chapters/episodes), in provider order
    pub units: Vec<Unit>,
}

/// One downloadable unit (chapter, episode) within a series
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Unit {
    /// Provider-scoped unit id
    pub id: String,
    /// Unit title, possibly empty
    #[serde(default)]
    pub title: String,
    /// Volume marker as the provider reports it ("" = none)
    #[serde(default)]
    pub volume: String,
    /// Chapter/episode marker as the provider reports it ("" = one-shot)
    #[serde(default)]
    pub chapter: String,
    /// Canonical URL of the unit
    #[serde(default)]
    pub url: String,
}

impl Unit {
    /// The volume as a float, or -1 when empty or unparseable
    pub fn volume_f64(&self) -> f64 {
        self.volume.parse().unwrap_or(-1.0)
    }

    /// The chapter as a float, or -1 when empty or unparseable
    pub fn chapter_f64(&self) -> f64 {
        self.chapter.parse().unwrap_or(-1.0)
    }

    /// Human-readable label, e.g. "Volume 2 Chapter 13: The Road"
    pub fn label(&self) -> String {
        if !self.chapter.is_empty() && !self.volume.is_empty() {
            return format!("Volume {} Chapter {}: {}", self.volume, self.chapter, self.title);
        }
        if !self.chapter.is_empty() {
            return format!("Chapter {}: {}", self.chapter, self.title);
        }
        format!("OneShot: {}", self.title)
    }
}

/// Volume/chapter markers parsed out of an on-disk file name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedFileName {
    /// Volume marker, "" when the name carries none
    pub volume: String,
    /// Chapter marker, "" when the name carries none
    pub chapter: String,
}

/// An archive already present on disk before the download started
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OnDiskUnit {
    /// File name, including extension
    pub name: String,
    /// Path relative to the configured root directory
    pub path: String,
    /// Volume marker parsed from the file name
    pub volume: String,
    /// Chapter marker parsed from the file name
    pub chapter: String,
}

/// Provider adapter consumed by the content state machine and pipeline
///
/// Implementations must be cheap to share (`Arc<dyn Repository>`) and safe to
/// call from multiple pipeline workers at once.
#[async_trait]
pub trait Repository: Send + Sync {
    /// The provider this repository serves
    fn provider(&self) -> Provider;

    /// Fetch series metadata, including the full unit list
    async fn series_info(
        &self,
        id: &str,
        request: &DownloadRequest,
    ) -> Result<SeriesInfo, ProviderError>;

    /// List the sub-resource URLs (pages/images) of one unit
    async fn unit_resources(&self, unit: &Unit) -> Result<Vec<String>, ProviderError>;

    /// Fetch one sub-unit payload.
    ///
    /// `index` is the 1-based position of the sub-unit within the unit.
    async fn fetch_sub_unit(
        &self,
        index: usize,
        unit: &Unit,
        url: &str,
    ) -> Result<Vec<u8>, ProviderError>;

    /// Write provider metadata (e.g. a ComicInfo file) into the unit's
    /// directory. Failures are logged but never abort the unit.
    async fn write_unit_metadata(&self, unit: &Unit, dir: &Path) -> Result<(), ProviderError> {
        let _ = (unit, dir);
        Ok(())
    }

    /// Decide whether an on-disk file name belongs to this provider's
    /// content, and parse its volume/chapter markers if so
    fn parse_on_disk(&self, file_name: &str) -> Option<ParsedFileName>;

    /// The volume grouping an on-disk archive actually belongs to.
    ///
    /// Providers that embed metadata inside their archives can answer more
    /// precisely than the file name does; `None` means "unknown", which
    /// disables the changed-volume re-download rule for that file.
    fn volume_on_disk(&self, on_disk: &OnDiskUnit) -> Result<Option<String>, ProviderError> {
        Ok(Some(on_disk.volume.clone()))
    }
}
