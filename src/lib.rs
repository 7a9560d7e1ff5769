//! # media-dl
//!
//! Highly configurable backend library for multi-unit media download
//! applications (manga chapters, webtoon episodes, episodic series).
//!
//! ## Design Philosophy
//!
//! media-dl is designed to be:
//! - **Provider-agnostic** - Sites plug in behind one narrow `Repository` contract
//! - **Sensible defaults** - Works out of the box with zero configuration
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_dl::{Config, DownloadRequest, MediaDownloader, Provider};
//! use std::collections::HashMap;
//!
//! # fn make_factory() -> media_dl::RepositoryFactory { unimplemented!() }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = MediaDownloader::new(Config::default()).await?;
//!     downloader.register_provider(Provider::Mangadex, make_factory());
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     downloader
//!         .download(DownloadRequest {
//!             provider: Provider::Mangadex,
//!             id: "some-series".to_string(),
//!             base_dir: "Manga".to_string(),
//!             temp_title: "Some Series".to_string(),
//!             start_immediately: true,
//!             extra: HashMap::new(),
//!         })
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Unit archiving (.cbz)
pub mod archive;
/// Configuration types
pub mod config;
/// Content item state machine and download pipeline
pub mod content;
/// Core downloader implementation (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Provider adapter contract
pub mod provider;
/// Request rate limiting with token bucket
pub mod rate_limiter;
/// Provider registry
pub mod registry;
/// Progress and speed tracking
pub mod speed_tracker;
/// I/O stage payload transforms
pub mod transform;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::Config;
pub use content::ContentItem;
pub use downloader::MediaDownloader;
pub use error::{Error, ProviderError, Result};
pub use provider::{OnDiskUnit, ParsedFileName, Repository, SeriesInfo, SeriesStatus, Unit};
pub use rate_limiter::RequestLimiter;
pub use registry::{Registry, RepositoryFactory};
pub use speed_tracker::SpeedTracker;
pub use transform::{NoOpTransform, Transform};
pub use types::{
    ContentState, DownloadRequest, DownloaderStats, Event, InfoStat, Provider, QueueStat,
    SpeedType, StopRequest,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's
/// `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_dl::{Config, MediaDownloader, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = MediaDownloader::new(Config::default()).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(downloader).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: MediaDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
