//! # Filesystem Façade
//!
//! Small, explicit helpers over the filesystem and memory-mapped I/O that
//! the buffer and database share: durable writes (file contents and the
//! parent directory entry), read-only maps of sealed files, numbered
//! directory listings, and a recursive delete that tolerates concurrent
//! additions.
//!
//! ## Durability Protocol
//!
//! A file does not durably exist until both its contents and its parent
//! directory entry are synced. [`write_durably`] and [`replace_durably`]
//! perform the full dance; callers that append to an already-registered
//! file only need `File::sync_data`.
//!
//! ## Transient Failures
//!
//! Deleting a directory can race with another thread still creating files
//! inside it. [`delete_dir_tolerant`] retries a bounded number of times
//! with a short backoff before giving up, logging each retry.

pub mod frames;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use eyre::{ensure, Result, WrapErr};
use memmap2::Mmap;
use tracing::warn;

use crate::config::{TRANSIENT_IO_BACKOFF_MS, TRANSIENT_IO_RETRIES};

/// Creates `dir` and any missing ancestors.
pub fn mkdirs(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("failed to create directory '{}'", dir.display()))
}

/// Syncs a directory entry so renames and creations inside it survive a
/// crash.
pub fn sync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)
        .wrap_err_with(|| format!("failed to open directory '{}' for sync", dir.display()))?;
    handle
        .sync_all()
        .wrap_err_with(|| format!("failed to sync directory '{}'", dir.display()))
}

/// Writes `bytes` to `path` and syncs both the file and its parent
/// directory before returning.
pub fn write_durably(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .wrap_err_with(|| format!("failed to create '{}'", path.display()))?;
    use std::io::Write;
    file.write_all(bytes)
        .wrap_err_with(|| format!("failed to write '{}'", path.display()))?;
    file.sync_all()
        .wrap_err_with(|| format!("failed to sync '{}'", path.display()))?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Atomically replaces `path` with `bytes` via a sibling temp file and a
/// rename, syncing file and directory. Readers observe either the old or
/// the new contents, never a torn mix.
pub fn replace_durably(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("'{}' has no parent directory", path.display()))?;
    let tmp = path.with_extension("tmp");
    write_durably(&tmp, bytes)?;
    fs::rename(&tmp, path).wrap_err_with(|| {
        format!(
            "failed to rename '{}' over '{}'",
            tmp.display(),
            path.display()
        )
    })?;
    sync_dir(parent)
}

/// Maps `path` read-only. The map stays valid until dropped; sealed files
/// are never modified in place, so no remap protocol is needed.
pub fn map_read(path: &Path) -> Result<Mmap> {
    let file = File::open(path)
        .wrap_err_with(|| format!("failed to open '{}' for mapping", path.display()))?;
    // Safety: sealed files are immutable once written and synced; the map
    // is never aliased by a writable mapping.
    unsafe { Mmap::map(&file) }
        .wrap_err_with(|| format!("failed to mmap '{}'", path.display()))
}

/// Lists `dir` entries named `<decimal>.<extension>`, ascending by number.
pub fn list_numbered_files(dir: &Path, extension: &str) -> Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    if !dir.exists() {
        return Ok(out);
    }
    let entries = fs::read_dir(dir)
        .wrap_err_with(|| format!("failed to read directory '{}'", dir.display()))?;
    for entry in entries {
        let entry = entry.wrap_err("failed to read directory entry")?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str());
        if let Some(number) = stem.and_then(|s| s.parse::<u64>().ok()) {
            out.push((number, path));
        }
    }
    out.sort_unstable_by_key(|(number, _)| *number);
    Ok(out)
}

/// Deletes `path` and everything under it. Files added concurrently are
/// retried on a best-effort basis with a bounded backoff.
pub fn delete_dir_tolerant(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let mut last_error = None;
    for attempt in 0..TRANSIENT_IO_RETRIES {
        match fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    attempt = attempt + 1,
                    error = %e,
                    "directory delete disturbed, retrying"
                );
                last_error = Some(e);
                thread::sleep(Duration::from_millis(TRANSIENT_IO_BACKOFF_MS));
            }
        }
    }
    Err(last_error
        .map(eyre::Report::from)
        .unwrap_or_else(|| eyre::eyre!("unreachable: retry loop without an error")))
    .wrap_err_with(|| format!("failed to delete directory '{}'", path.display()))
}

/// Removes a single file, treating "already gone" as success.
pub fn delete_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).wrap_err_with(|| format!("failed to delete file '{}'", path.display()))
        }
    }
}

/// Opens a file for appending, creating it if missing.
pub fn open_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .wrap_err_with(|| format!("failed to open '{}' for append", path.display()))
}

pub fn file_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path)
        .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?;
    ensure!(metadata.is_file(), "'{}' is not a file", path.display());
    Ok(metadata.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn numbered_listing_is_ascending_and_filtered() {
        let dir = tempdir().unwrap();
        for name in ["3.blk", "1.blk", "2.blk", "10.blk", "junk.blk", "4.idx"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let files = list_numbered_files(dir.path(), "blk").unwrap();
        let numbers: Vec<u64> = files.iter().map(|(n, _)| *n).collect();
        assert_eq!(numbers, vec![1, 2, 3, 10]);
    }

    #[test]
    fn replace_is_atomic_from_the_reader_side() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cursor");
        replace_durably(&path, b"first").unwrap();
        replace_durably(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn delete_handles_missing_paths() {
        let dir = tempdir().unwrap();
        assert!(delete_dir_tolerant(&dir.path().join("nope")).is_ok());
        assert!(delete_file(&dir.path().join("nope.blk")).is_ok());
    }
}
