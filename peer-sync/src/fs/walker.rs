//! Directory traversal for manifest building.
//!
//! Only regular files are reported. Entries whose name starts with `.` are
//! skipped, and hidden directories (including the trash folder) are never
//! descended into. Symlinks, devices and pipes are skipped without being
//! followed.

use crate::fs::metadata::FileStamp;
use crate::fs::paths::to_slash_path;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Skip dot-prefixed entries and do not descend into dot-prefixed directories
    pub skip_hidden: bool,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            skip_hidden: true,
        }
    }
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Forward-slash path relative to the root
    pub relative_path: String,

    /// Size and modification time
    pub stamp: FileStamp,
}

/// Counters describing one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub files: usize,
    pub skipped_errors: usize,
    pub skipped_special: usize,
}

/// Walk a tree, calling `callback` for every eligible regular file.
///
/// The root itself must be a readable directory. Errors on individual entries
/// below it (permission quirks, races with deletion) are logged and skipped.
/// An error returned by the callback stops the walk and is returned as is.
pub fn walk_files<F, E>(root: &Path, options: &WalkOptions, mut callback: F) -> Result<WalkSummary, E>
where
    F: FnMut(FileInfo) -> Result<(), E>,
    E: From<std::io::Error>,
{
    let root_meta = std::fs::metadata(root)?;
    if !root_meta.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} is not a directory", root.display()),
        )
        .into());
    }

    let walker = WalkDir::new(root).follow_links(false);

    let skip_hidden = options.skip_hidden;
    let mut summary = WalkSummary::default();

    for entry in walker
        .into_iter()
        .filter_entry(|e| !(skip_hidden && e.depth() > 0 && is_hidden(e)))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                summary.skipped_errors += 1;
                continue;
            }
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            summary.skipped_special += 1;
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(relative_path) = to_slash_path(relative) else {
            warn!(path = %entry.path().display(), "Skipping file with a non UTF-8 name");
            summary.skipped_errors += 1;
            continue;
        };

        let stamp = match entry.metadata().map_err(std::io::Error::from).and_then(|m| FileStamp::from_metadata(&m)) {
            Ok(stamp) => stamp,
            Err(e) => {
                warn!(path = %relative_path, error = %e, "Skipping file whose metadata cannot be read");
                summary.skipped_errors += 1;
                continue;
            }
        };

        summary.files += 1;
        callback(FileInfo {
            path: entry.path().to_path_buf(),
            relative_path,
            stamp,
        })?;
    }

    Ok(summary)
}

/// Walk a tree and collect every eligible regular file.
#[cfg(test)]
pub(crate) fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_files(root, options, |file| {
        files.push(file);
        Ok::<(), std::io::Error>(())
    })?;
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(files: &[FileInfo]) -> Vec<String> {
        let mut names: Vec<String> = files.iter().map(|f| f.relative_path.clone()).collect();
        names.sort();
        names
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories_uses_forward_slashes() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join("subdir/deeper"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/deeper/file2.txt"), b"content2")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(names(&files), vec!["file1.txt", "subdir/deeper/file2.txt"]);

        Ok(())
    }

    #[test]
    fn test_hidden_entries_and_trash_are_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file.txt"), b"keep")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"exclude")?;
        fs::create_dir(temp_dir.path().join(".trash"))?;
        fs::write(temp_dir.path().join(".trash/deleted.txt"), b"exclude")?;
        fs::create_dir(temp_dir.path().join("docs"))?;
        fs::write(temp_dir.path().join("docs/.hidden"), b"exclude")?;

        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(names(&files), vec!["file.txt"]);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_are_not_followed() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = TempDir::new()?;

        fs::write(outside.path().join("secret.txt"), b"outside")?;
        fs::write(temp_dir.path().join("real.txt"), b"inside")?;
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), temp_dir.path().join("link.txt"))?;
        std::os::unix::fs::symlink(outside.path(), temp_dir.path().join("linkdir"))?;

        let mut collected = Vec::new();
        let summary = walk_files(temp_dir.path(), &WalkOptions::default(), |f| {
            collected.push(f);
            Ok::<(), std::io::Error>(())
        })?;

        assert_eq!(names(&collected), vec!["real.txt"]);
        assert_eq!(summary.skipped_special, 2);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");
        assert!(walk_directory(&missing, &WalkOptions::default()).is_err());
    }

    #[test]
    fn test_callback_error_stops_walk() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("a.txt"), b"a")?;
        fs::write(temp_dir.path().join("b.txt"), b"b")?;

        let mut seen = 0;
        let result = walk_files(temp_dir.path(), &WalkOptions::default(), |_| {
            seen += 1;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "stop"))
        });

        assert!(result.is_err());
        assert_eq!(seen, 1);
        Ok(())
    }
}
