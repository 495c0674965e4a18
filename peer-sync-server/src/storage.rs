//! On-disk layout of the backups a peer holds.
//!
//! Incremental mirrors live under `<incoming>/<origin>/<owner>_<share>/`,
//! extracted archives under `<archives>/<origin>/<owner>_<share>/`. Every
//! client-supplied component is validated before it touches a path.

use crate::error::AppError;
use peer_sync::fs::paths::{is_safe_segment, safe_relative_path, to_slash_path};
use peer_sync::manifest::ENCRYPTED_SUFFIX;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Origin used when a client does not name one.
pub const DEFAULT_ORIGIN: &str = "unknown";

/// Directory of one backup, validated against its root.
#[derive(Debug, Clone)]
pub struct BackupDir {
    root: PathBuf,
}

impl BackupDir {
    pub fn resolve(base: &Path, origin: &str, owner_id: i64, share_name: &str) -> Result<Self, AppError> {
        if !is_safe_segment(origin) {
            return Err(AppError::BadRequest(format!("Invalid source server: {origin:?}")));
        }
        if !is_safe_segment(share_name) {
            return Err(AppError::BadRequest(format!("Invalid share name: {share_name:?}")));
        }
        Ok(Self {
            root: base.join(origin).join(format!("{owner_id}_{share_name}")),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a blob or metadata file inside this backup.
    pub fn file(&self, relative: &str) -> Result<PathBuf, AppError> {
        safe_relative_path(relative)
            .map(|rel| self.root.join(rel))
            .ok_or_else(|| AppError::BadRequest(format!("Invalid path: {relative:?}")))
    }

    /// Hidden sibling of `dest` to write into before renaming over it.
    pub fn temp_for(dest: &Path) -> PathBuf {
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        dest.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
    }

    /// Remove `path`. A file that is already gone is not an error. Empty
    /// parent directories are removed up to the backup root.
    pub fn remove_file(&self, path: &Path) -> io::Result<bool> {
        let removed = match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            // Fails on non-empty directories, which ends the pruning.
            if std::fs::remove_dir(current).is_err() {
                break;
            }
            dir = current.parent();
        }
        Ok(removed)
    }

    /// Every encrypted blob stored in this backup, as forward-slash paths.
    ///
    /// Dot-prefixed files (the manifest, source info, in-flight uploads) are
    /// not blobs and are left out.
    pub fn physical_files(&self) -> io::Result<Vec<String>> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.starts_with('.') || !name.ends_with(ENCRYPTED_SUFFIX) {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            if let Some(path) = to_slash_path(relative) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
