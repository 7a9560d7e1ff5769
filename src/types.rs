//! Core types for media-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content provider identifier
///
/// Closed set of supported providers. Each variant is backed by a repository
/// factory registered on the [`Registry`](crate::registry::Registry); a
/// request for a provider without a registered factory fails with
/// [`Error::ProviderNotSupported`](crate::error::Error::ProviderNotSupported).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Nyaa torrent tracker
    Nyaa,
    /// YTS movie tracker
    Yts,
    /// LimeTorrents tracker
    LimeTorrents,
    /// SubsPlease release feed
    SubsPlease,
    /// MangaDex manga site
    Mangadex,
    /// Webtoon episode site
    Webtoon,
    /// Dynasty scans
    Dynasty,
    /// Bato manga site
    Bato,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Provider::Nyaa => "Nyaa",
            Provider::Yts => "YTS",
            Provider::LimeTorrents => "LimeTorrents",
            Provider::SubsPlease => "SubsPlease",
            Provider::Mangadex => "MangaDex",
            Provider::Webtoon => "Webtoon",
            Provider::Dynasty => "Dynasty",
            Provider::Bato => "Bato",
        };
        write!(f, "{name}")
    }
}

/// Lifecycle state of one content item
///
/// Ordered lifecycle: `Queued → Loading → {Ready | Waiting} → Downloading →
/// Cleanup → (removed)`. A provider has at most one item in `Loading` or
/// `Downloading` at a time; the other states never block new admissions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentState {
    /// Admitted but the provider worker has not picked it up yet
    Queued,
    /// Retrieving the metadata needed to start downloading
    Loading,
    /// Metadata loaded; waiting for the user to authorize the download,
    /// or nothing new to fetch
    Waiting,
    /// Authorized and queued for the download lane
    Ready,
    /// Sub-unit downloads in flight
    Downloading,
    /// All downloads finished, archiving in progress — must not be restarted
    Cleanup,
}

impl ContentState {
    /// Whether this state makes the provider "busy" for admission purposes.
    ///
    /// Only `Loading` and `Downloading` block new admissions; loading and
    /// cleanup of different items may overlap.
    pub fn is_active(&self) -> bool {
        matches!(self, ContentState::Loading | ContentState::Downloading)
    }
}

impl std::fmt::Display for ContentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ContentState::Queued => "queued",
            ContentState::Loading => "loading",
            ContentState::Waiting => "waiting",
            ContentState::Ready => "ready",
            ContentState::Downloading => "downloading",
            ContentState::Cleanup => "cleanup",
        };
        write!(f, "{name}")
    }
}

/// Well-known keys for [`DownloadRequest::extra`]
pub mod options {
    /// Overrides the series title used for directories and file names
    pub const TITLE_OVERRIDE: &str = "title_override";
}

/// Request to download one content item
///
/// Immutable once accepted; created by the caller and read throughout the
/// item's lifetime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Provider that hosts the content
    pub provider: Provider,

    /// Provider-scoped content id (series id, info hash, ...)
    pub id: String,

    /// Directory the content is downloaded into, relative to the configured
    /// root directory
    #[serde(rename = "dir")]
    pub base_dir: String,

    /// Display title to use until metadata has loaded
    #[serde(rename = "title", default)]
    pub temp_title: String,

    /// Start downloading as soon as metadata has loaded, without waiting for
    /// user authorization
    #[serde(default)]
    pub start_immediately: bool,

    /// Provider-specific toggles (string keyed, multi-valued)
    #[serde(default)]
    pub extra: HashMap<String, Vec<String>>,
}

impl DownloadRequest {
    /// Returns the first value for `key`, if present and non-empty
    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.extra
            .get(key)
            .and_then(|v| v.first())
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Returns the first value for `key`, or `fallback` when absent
    pub fn get_string_or<'a>(&'a self, key: &str, fallback: &'a str) -> &'a str {
        self.get_string(key).unwrap_or(fallback)
    }

    /// Returns all values for `key`
    pub fn get_strings(&self, key: &str) -> &[String] {
        self.extra.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    /// Returns the first value for `key` parsed as a bool, or `fallback`
    pub fn get_bool(&self, key: &str, fallback: bool) -> bool {
        self.get_string(key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(fallback)
    }

    /// Snapshot used while the request waits for its provider to free up
    pub fn to_queue_stat(&self) -> QueueStat {
        QueueStat {
            provider: self.provider,
            id: self.id.clone(),
            name: self.temp_title.clone(),
            base_dir: self.base_dir.clone(),
            added_at: Utc::now(),
        }
    }
}

/// Request to stop (and optionally delete) one content item
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StopRequest {
    /// Provider that hosts the content
    pub provider: Provider,

    /// Content id to stop
    pub id: String,

    /// Delete files created by this run instead of archiving them
    #[serde(default)]
    pub delete_files: bool,
}

/// Unit of measure for the speed reported in [`InfoStat`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedType {
    /// Bytes per second
    Bytes,
    /// Volumes per second
    Volumes,
    /// Images (sub-units) per second
    Images,
}

/// Snapshot of one active content item for external observers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InfoStat {
    /// Provider that hosts the content
    pub provider: Provider,
    /// Content id
    pub id: String,
    /// Current lifecycle state
    pub state: ContentState,
    /// Display name (series title once metadata has loaded)
    pub name: String,
    /// Canonical URL of the content on the provider's site
    pub ref_url: String,
    /// Human-readable size label, e.g. "12 units"
    pub size: String,
    /// Whether sub-unit downloads are currently in flight
    pub downloading: bool,
    /// Overall progress in percent (0-100)
    pub progress: f64,
    /// Estimated seconds until completion, when computable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated: Option<u64>,
    /// Unit of measure for `speed`
    pub speed_type: SpeedType,
    /// Current speed in `speed_type` units per second
    pub speed: f64,
    /// Directory the content downloads into, relative to the root directory
    pub download_dir: String,
}

/// Snapshot of a request waiting for its provider to free up
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStat {
    /// Provider the request is waiting on
    pub provider: Provider,
    /// Content id
    pub id: String,
    /// Display title from the original request
    #[serde(default)]
    pub name: String,
    /// Target base directory from the original request
    pub base_dir: String,
    /// When the request entered the waiting list
    pub added_at: DateTime<Utc>,
}

impl QueueStat {
    /// Rebuild a download request once the provider has freed up.
    ///
    /// Deferred requests always start immediately; the user already asked
    /// for them once.
    pub fn to_download_request(&self) -> DownloadRequest {
        DownloadRequest {
            provider: self.provider,
            id: self.id.clone(),
            base_dir: self.base_dir.clone(),
            temp_title: self.name.clone(),
            start_immediately: true,
            extra: HashMap::new(),
        }
    }
}

/// Combined view of running and waiting downloads
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloaderStats {
    /// Snapshots of all tracked content items
    pub running: Vec<InfoStat>,
    /// Requests still waiting for their provider to free up
    pub queued: Vec<QueueStat>,
}

/// Event emitted during the content lifecycle
///
/// Consumers subscribe via
/// [`MediaDownloader::subscribe`](crate::downloader::MediaDownloader::subscribe);
/// events replace the push-notification and progress-callback collaborators
/// an embedding application would otherwise wire in.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Content admitted and tracked
    ContentAdded {
        /// Snapshot of the new item
        info: InfoStat,
    },

    /// A request was deferred because its provider is busy
    ContentQueued {
        /// Snapshot of the waiting request
        stat: QueueStat,
    },

    /// Content item changed lifecycle state
    StateChanged {
        /// Content id
        id: String,
        /// New state
        state: ContentState,
    },

    /// Periodic progress update for a downloading item
    Progress {
        /// Content id
        id: String,
        /// Overall progress in percent (0-100)
        progress: f64,
        /// Unit of measure for `speed`
        speed_type: SpeedType,
        /// Current speed in `speed_type` units per second
        speed: f64,
    },

    /// The number of units selected for download changed
    SizeChanged {
        /// Content id
        id: String,
        /// New human-readable size label
        size: String,
    },

    /// A download finished and its output was archived
    DownloadFinished {
        /// Content id
        id: String,
        /// Display name
        name: String,
        /// Labels of the units downloaded this run
        new_units: Vec<String>,
        /// Number of units that replaced an older on-disk copy
        re_downloads: usize,
        /// Number of sub-unit downloads that failed at least once
        failed: u64,
    },

    /// A download was aborted by an unrecoverable error
    DownloadFailed {
        /// Content id
        id: String,
        /// Display name
        name: String,
        /// Human-readable failure reason
        error: String,
    },

    /// Errors occurred while deleting or archiving output
    CleanupFailed {
        /// Content id
        id: String,
        /// Human-readable error descriptions
        errors: Vec<String>,
    },

    /// Content removed from the active set
    ContentRemoved {
        /// Content id
        id: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}
