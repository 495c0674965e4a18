//! Tar+zstd archives for the full-archive strategy.
//!
//! The sender packs the same files the manifest builder would see; the
//! receiver extracts regular files and directories only, rejecting any entry
//! whose name would land outside the destination.

use crate::fs::paths::safe_relative_path;
use crate::fs::walker::{walk_files, FileInfo, WalkOptions};
use crate::{Result, SyncError};
use std::fs;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: usize,
    pub bytes: u64,
}

/// Pack `source` into `out` and return the writer once the archive is complete.
pub fn write_archive<W: Write>(source: &Path, out: W, level: i32) -> Result<(ArchiveStats, W)> {
    let encoder = zstd::Encoder::new(out, level)?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut stats = ArchiveStats::default();
    walk_files(source, &WalkOptions::default(), |file: FileInfo| -> Result<()> {
        builder
            .append_path_with_name(&file.path, &file.relative_path)
            .map_err(|e| SyncError::Archive(format!("{}: {}", file.relative_path, e)))?;
        stats.files += 1;
        stats.bytes += file.stamp.size;
        Ok(())
    })?;

    let encoder = builder.into_inner()?;
    let out = encoder.finish()?;
    debug!("Archived {} files ({} bytes) from {}", stats.files, stats.bytes, source.display());
    Ok((stats, out))
}

/// Extract an archive produced by [`write_archive`] under `dest`.
///
/// Entries with absolute names or `..` components fail the extraction.
/// Links and special files are skipped.
pub fn extract_archive<R: Read>(reader: R, dest: &Path) -> Result<ArchiveStats> {
    let decoder = zstd::Decoder::new(reader)?;
    let mut archive = tar::Archive::new(decoder);
    fs::create_dir_all(dest)?;

    let mut stats = ArchiveStats::default();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let relative = safe_relative_path(&name)
            .ok_or_else(|| SyncError::Archive(format!("entry {name:?} escapes the destination")))?;
        let target = dest.join(&relative);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !kind.is_file() {
            warn!("Skipping non-regular archive entry {}", name);
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&target)
            .map_err(|e| SyncError::Archive(format!("{name}: {e}")))?;
        stats.files += 1;
        stats.bytes += entry.header().size().unwrap_or(0);
    }
    Ok(stats)
}
