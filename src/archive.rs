//! Unit archiving
//!
//! Completed unit directories are packed into `.cbz` archives (plain zip with
//! a comic-book extension) during the cleanup phase. Pages are stored without
//! compression — image payloads don't compress, and readers open stored
//! archives faster.

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Pack `dir` into a sibling `<dir>.cbz` archive and return its path.
///
/// Files directly inside `dir` are stored at the archive root; nested
/// directories keep their relative layout. The source directory is left in
/// place — callers remove it once the archive is written.
///
/// This performs blocking I/O; call it through `spawn_blocking` from async
/// contexts.
pub fn zip_dir_to_cbz(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("not a directory: {}", dir.display()),
        )));
    }

    let archive_path = dir.with_extension("cbz");
    let file = File::create(&archive_path)?;
    let mut writer = ZipWriter::new(file);
    let options = FileOptions::default().compression_method(CompressionMethod::Stored);

    add_dir_entries(&mut writer, dir, dir, options)?;

    writer.finish()?;
    Ok(archive_path)
}

fn add_dir_entries(
    writer: &mut ZipWriter<File>,
    root: &Path,
    dir: &Path,
    options: FileOptions,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    // Deterministic archive layout regardless of directory iteration order
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| Error::Other(format!("path outside archive root: {e}")))?;
        let name = relative.to_string_lossy().replace('\\', "/");

        if path.is_dir() {
            writer.add_directory(name, options)?;
            add_dir_entries(writer, root, &path, options)?;
        } else {
            writer.start_file(name, options)?;
            let mut contents = Vec::new();
            File::open(&path)?.read_to_end(&mut contents)?;
            writer.write_all(&contents)?;
        }
    }

    Ok(())
}
