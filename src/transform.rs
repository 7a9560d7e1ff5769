//! Payload transforms applied by the I/O stage
//!
//! Downloaded sub-unit payloads pass through a [`Transform`] before being
//! written to disk. Embedders supply an implementation to re-encode images
//! (e.g. to webp); the default [`NoOpTransform`] writes payloads unchanged.

/// Transform applied to every sub-unit payload before the disk write
///
/// Implementations must be safe to call concurrently from all I/O workers.
pub trait Transform: Send + Sync {
    /// Transform `data`, returning the payload to write and the file
    /// extension it should carry (without the leading dot).
    ///
    /// `source_ext` is the extension taken from the source URL; return it
    /// unchanged to keep the original format.
    fn apply(&self, data: Vec<u8>, source_ext: &str) -> (Vec<u8>, String);

    /// Name of the transform implementation, for logging
    fn name(&self) -> &str;
}

/// Pass-through transform that keeps payloads and extensions as-is
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpTransform;

impl Transform for NoOpTransform {
    fn apply(&self, data: Vec<u8>, source_ext: &str) -> (Vec<u8>, String) {
        (data, source_ext.to_string())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Extension of the final path segment of a source URL, defaulting to "jpg"
/// when the URL carries none
pub(crate) fn url_extension(url: &str) -> &str {
    let tail = url
        .rsplit('/')
        .next()
        .unwrap_or(url)
        .split(['?', '#'])
        .next()
        .unwrap_or_default();

    match tail.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => ext,
        _ => "jpg",
    }
}
