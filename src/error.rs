//! Error types for media-dl
//!
//! This module provides the error surface for the library:
//! - A top-level [`Error`] enum covering admission, lifecycle and I/O failures
//! - [`ProviderError`] — the opaque error providers return across the
//!   [`Repository`](crate::provider::Repository) boundary
//! - A [`Result`] alias used throughout the crate

use crate::types::Provider;
use thiserror::Error;

/// Result type alias for media-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-dl
///
/// Admission errors (`ProviderNotSupported`, `AlreadyExists`, `QueueFull`,
/// `NotFound`) are surfaced synchronously to the caller of
/// [`download`](crate::downloader::MediaDownloader::download) /
/// [`remove_download`](crate::downloader::MediaDownloader::remove_download).
/// Provider errors are opaque and propagate as the terminal failure reason.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "root_dir")
        key: Option<String>,
    },

    /// No repository factory registered for the requested provider
    #[error("provider not supported: {0}")]
    ProviderNotSupported(Provider),

    /// A download with this id is already tracked
    #[error("content already exists: {0}")]
    AlreadyExists(String),

    /// No active or queued download with this id
    #[error("content not found: {0}")]
    NotFound(String),

    /// A provider queue lane is saturated; the caller should retry later
    #[error("provider queue full for {provider}")]
    QueueFull {
        /// The provider whose lane rejected the item
        provider: Provider,
    },

    /// Operation not valid in the content's current state
    #[error("cannot {operation} content {id} in state {current_state}")]
    InvalidState {
        /// The content id in an invalid state for the operation
        id: String,
        /// The operation that was attempted (e.g., "start", "select")
        operation: String,
        /// The state that prevents the operation
        current_state: String,
    },

    /// A sub-unit download failed on both the primary and the retry pass
    #[error("final download failed on url {url}: {source}")]
    SubUnitFailed {
        /// Source locator of the sub-unit that failed twice
        url: String,
        /// The provider error from the retry attempt
        source: ProviderError,
    },

    /// Provider adapter failure (metadata fetch, resource listing, ...)
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Archive creation failed
    #[error("archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Operation was cancelled — the expected signal path for a deliberate
    /// stop, never reported as a user-facing failure
    #[error("operation cancelled")]
    Cancelled,

    /// Shutdown in progress - not accepting new downloads
    #[error("shutdown in progress: not accepting new downloads")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error is the cancellation signal.
    ///
    /// Cancellation is filtered out of failure notifications and abort
    /// handling: it means someone asked us to stop, not that something broke.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Opaque error returned by provider adapters
///
/// The core never inspects provider failures beyond their message; they are
/// carried through to the terminal failure event verbatim.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ProviderError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl ProviderError {
    /// Create a provider error from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Create a provider error wrapping an underlying cause
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}
