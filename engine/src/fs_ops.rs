//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Enumerating a source tree into (source, destination, size) entries
//! - Creating the destination directory
//! - Creating in-progress temporary files next to their final destination
//! - Preserving modification times
//! - Sweeping temporary files left behind by an interrupted run

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Prefix of every in-progress temporary file.
pub const TEMP_PREFIX: &str = ".ingest-";
/// Suffix of every in-progress temporary file.
pub const TEMP_SUFFIX: &str = ".partial";

/// A regular file found while enumerating a source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub size: u64,
}

/// Whether `name` looks like one of our in-progress temporary files.
pub fn is_temp_file_name(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Enumerate every regular file under `source`, mirroring its relative path
/// under `destination_root`.
///
/// Entries come back sorted by source path so that task indices are stable
/// between runs. Our own temporary files are skipped.
///
/// # Errors
/// Fails if any directory in the tree cannot be read.
pub fn enumerate_files(source: &Path, destination_root: &Path) -> io::Result<Vec<SourceEntry>> {
    fn recurse(
        dir: &Path,
        rel_path: &Path,
        destination_root: &Path,
        entries: &mut Vec<SourceEntry>,
    ) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let file_name = entry.file_name();
            let rel_full_path = rel_path.join(&file_name);

            if file_type.is_dir() {
                recurse(&entry.path(), &rel_full_path, destination_root, entries)?;
            } else if file_type.is_file() {
                if is_temp_file_name(&file_name.to_string_lossy()) {
                    continue;
                }
                entries.push(SourceEntry {
                    source: entry.path(),
                    destination: destination_root.join(&rel_full_path),
                    size: entry.metadata()?.len(),
                });
            }
        }
        Ok(())
    }

    let mut entries = Vec::new();
    recurse(source, Path::new(""), destination_root, &mut entries)?;
    entries.sort_by(|a, b| a.source.cmp(&b.source));
    Ok(entries)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Fails if the parent exists but is not a directory, or cannot be created.
pub fn ensure_parent_dir_exists(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    // Skip if parent is empty path (relative root)
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("parent path exists but is not a directory: {}", parent.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(parent),
        Err(e) => Err(e),
    }
}

/// Create a uniquely-named temporary file in the same directory as
/// `destination`, so that the final rename never crosses a filesystem.
///
/// The file is removed automatically when the returned handle is dropped
/// without being persisted.
pub fn create_temp_sibling(destination: &Path) -> io::Result<NamedTempFile> {
    let dir = match destination.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let stem = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    tempfile::Builder::new()
        .prefix(&format!("{TEMP_PREFIX}{stem}."))
        .suffix(TEMP_SUFFIX)
        .rand_bytes(8)
        .tempfile_in(dir)
}

/// Copy `modified` onto `path`. Failures are logged, not returned: a wrong
/// mtime is not worth failing an otherwise verified copy.
pub fn preserve_mtime(path: &Path, modified: Option<SystemTime>) {
    let Some(mtime) = modified else {
        return;
    };
    if let Err(e) = filetime::set_file_mtime(path, filetime::FileTime::from_system_time(mtime)) {
        warn!(path = %path.display(), error = %e, "could not preserve modification time");
    }
}

/// Remove temporary files left in `dir` by an interrupted run.
///
/// Only direct children matching our temp naming are touched. Returns the
/// number of files removed.
pub fn remove_stale_temp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if !is_temp_file_name(&entry.file_name().to_string_lossy()) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(path = %entry.path().display(), "removed stale temp file");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}
