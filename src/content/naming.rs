//! Directory and file name layout for downloaded units
//!
//! Layout: `<root>/<base_dir>/<title>[/<title> Vol. <v>]/<file name>` where
//! the file name carries the chapter marker zero-padded to four integer
//! digits so lexical and numeric ordering agree.

use super::{lock, read, ContentItem};
use crate::provider::Unit;
use crate::types::options;
use std::path::PathBuf;

impl ContentItem {
    /// Display title: explicit override, then series title, then the
    /// request's temporary title, then the raw id
    pub fn title(&self) -> String {
        if let Some(title) = self.request.get_string(options::TITLE_OVERRIDE) {
            return title.to_string();
        }
        if let Some(series) = read(&self.series).as_ref() {
            if !series.title.is_empty() {
                return series.title.clone();
            }
        }
        if !self.request.temp_title.is_empty() {
            return self.request.temp_title.clone();
        }
        self.request.id.clone()
    }

    /// Directory the content downloads into, relative to the root directory
    pub fn download_dir_rel(&self) -> PathBuf {
        let title = self.title();
        if title.is_empty() {
            return PathBuf::from(&self.request.base_dir);
        }
        PathBuf::from(&self.request.base_dir).join(title)
    }

    /// Name of the volume directory a unit belongs to
    pub(crate) fn volume_dir_name(&self, unit: &Unit) -> String {
        format!("{} Vol. {}", self.title(), unit.volume)
    }

    /// Directory one unit's pages are written into, relative to the root
    pub(crate) fn unit_dir_rel(&self, unit: &Unit) -> PathBuf {
        let mut dir = self.download_dir_rel();
        if !unit.volume.is_empty() {
            dir = dir.join(self.volume_dir_name(unit));
        }
        dir.join(self.unit_file_name(unit))
    }

    /// Absolute directory one unit's pages are written into
    pub(crate) fn unit_dir_abs(&self, unit: &Unit) -> PathBuf {
        self.config.root_dir.join(self.unit_dir_rel(unit))
    }

    /// File name for a unit (without extension)
    pub(crate) fn unit_file_name(&self, unit: &Unit) -> String {
        if unit.chapter.is_empty() {
            self.one_shot_file_name(unit)
        } else {
            self.default_file_name(unit)
        }
    }

    fn default_file_name(&self, unit: &Unit) -> String {
        let mut name = self.title();

        if !unit.volume.is_empty() && self.should_include_volume() {
            name.push_str(&format!(" Vol. {}", unit.volume));
        }

        match pad_marker(&unit.chapter, 4) {
            Some(padded) => format!("{name} Ch. {padded}"),
            None => {
                tracing::warn!(
                    content_id = %self.id(),
                    chapter = %unit.chapter,
                    "failed to parse chapter marker, not padding"
                );
                format!("{name} Ch. {}", unit.chapter)
            }
        }
    }

    fn one_shot_file_name(&self, unit: &Unit) -> String {
        let mut base = self.title();
        if !unit.title.is_empty() {
            base.push(' ');
            base.push_str(&unit.title);
        }
        base.push_str(" (One Shot)");

        let downloaded: Vec<String> = lock(&self.has_downloaded)
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        let mut name = base.clone();
        let mut attempt = 0usize;
        while downloaded.contains(&name) {
            attempt += 1;
            name = format!("{base} ({attempt})");
            if attempt > 25 {
                tracing::warn!(
                    content_id = %self.id(),
                    unit = %unit.title,
                    attempts = attempt,
                    "too many same-named one shots, keeping last numbered name"
                );
                break;
            }
        }
        name
    }
}

/// Zero-pad the integer part of a numeric marker to `width` digits.
///
/// `"7"` becomes `"0007"`, `"12.5"` becomes `"0012.5"`. Returns `None` when
/// the marker is not numeric.
pub(crate) fn pad_marker(marker: &str, width: usize) -> Option<String> {
    marker.parse::<f64>().ok()?;

    match marker.split_once('.') {
        Some((int_part, frac)) => Some(format!("{int_part:0>width$}.{frac}")),
        None => Some(format!("{marker:0>width$}")),
    }
}
