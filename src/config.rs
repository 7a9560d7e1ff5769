//! Configuration types for media-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for [`MediaDownloader`](crate::downloader::MediaDownloader)
///
/// Works out of the box with `Config::default()`; every knob has a sensible
/// default and is covered by [`validate`](Config::validate).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory all downloads land under (default: "./downloads")
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Maximum concurrent sub-unit downloads per unit pipeline
    /// (default: 4, clamped to [1, 5] at use)
    #[serde(default = "default_max_concurrent_images")]
    pub max_concurrent_images: usize,

    /// Sub-unit fetches per second shared by one pipeline's workers.
    /// `None` matches the worker pool width — the default throttle.
    #[serde(default)]
    pub images_per_second: Option<u64>,

    /// Capacity of each provider queue lane (default: 100)
    #[serde(default = "default_queue_capacity")]
    pub provider_queue_capacity: usize,

    /// I/O stage channel capacity as a multiple of the worker pool width
    /// (default: 2 — I/O may be slower than downloading when transforming)
    #[serde(default = "default_io_queue_factor")]
    pub io_queue_factor: usize,

    /// Units with fewer sub-units than this get a courtesy delay before the
    /// next unit starts (default: 5)
    #[serde(default = "default_small_unit_threshold")]
    pub small_unit_threshold: usize,

    /// Courtesy delay applied after small units (default: 1s)
    #[serde(default = "default_small_unit_delay")]
    pub small_unit_delay: Duration,

    /// Interval between progress events while downloading (default: 2s)
    #[serde(default = "default_progress_interval")]
    pub progress_interval: Duration,

    /// How long a cancel waits for in-flight workers, per phase (default: 60s)
    #[serde(default = "default_cancel_wait")]
    pub cancel_wait: Duration,

    /// How long an abort waits for workers to drain, per phase (default: 120s)
    #[serde(default = "default_abort_wait")]
    pub abort_wait: Duration,

    /// How long a provider queue shutdown waits for its worker (default: 30s)
    #[serde(default = "default_queue_shutdown_wait")]
    pub queue_shutdown_wait: Duration,

    /// How long shutdown waits for outstanding cleanup tasks (default: 45s)
    #[serde(default = "default_cleanup_shutdown_wait")]
    pub cleanup_shutdown_wait: Duration,

    /// Emit a finished event even when a run downloaded nothing new
    /// (default: false)
    #[serde(default)]
    pub log_empty_downloads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            max_concurrent_images: default_max_concurrent_images(),
            images_per_second: None,
            provider_queue_capacity: default_queue_capacity(),
            io_queue_factor: default_io_queue_factor(),
            small_unit_threshold: default_small_unit_threshold(),
            small_unit_delay: default_small_unit_delay(),
            progress_interval: default_progress_interval(),
            cancel_wait: default_cancel_wait(),
            abort_wait: default_abort_wait(),
            queue_shutdown_wait: default_queue_shutdown_wait(),
            cleanup_shutdown_wait: default_cleanup_shutdown_wait(),
            log_empty_downloads: false,
        }
    }
}

impl Config {
    /// Validate the configuration, returning the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.root_dir.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "root_dir must not be empty".to_string(),
                key: Some("root_dir".to_string()),
            });
        }

        if self.max_concurrent_images == 0 {
            return Err(Error::Config {
                message: "max_concurrent_images must be at least 1".to_string(),
                key: Some("max_concurrent_images".to_string()),
            });
        }

        if self.provider_queue_capacity == 0 {
            return Err(Error::Config {
                message: "provider_queue_capacity must be at least 1".to_string(),
                key: Some("provider_queue_capacity".to_string()),
            });
        }

        if self.io_queue_factor == 0 {
            return Err(Error::Config {
                message: "io_queue_factor must be at least 1".to_string(),
                key: Some("io_queue_factor".to_string()),
            });
        }

        Ok(())
    }

    /// The effective per-pipeline worker pool width, clamped to [1, 5]
    pub fn worker_pool_width(&self) -> usize {
        self.max_concurrent_images.clamp(1, 5)
    }

    /// The effective sub-unit fetch rate: explicit, or the pool width
    pub fn effective_images_per_second(&self) -> u64 {
        self.images_per_second
            .unwrap_or(self.worker_pool_width() as u64)
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_concurrent_images() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    100
}

fn default_io_queue_factor() -> usize {
    2
}

fn default_small_unit_threshold() -> usize {
    5
}

fn default_small_unit_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_progress_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_cancel_wait() -> Duration {
    Duration::from_secs(60)
}

fn default_abort_wait() -> Duration {
    Duration::from_secs(120)
}

fn default_queue_shutdown_wait() -> Duration {
    Duration::from_secs(30)
}

fn default_cleanup_shutdown_wait() -> Duration {
    Duration::from_secs(45)
}
