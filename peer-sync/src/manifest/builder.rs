//! Builds a manifest for a share tree, reusing checksums from a local cache.
//!
//! A file is rehashed only when its size or mtime differs from the cached
//! record. The cache lives inside the tree as a hidden file (and is therefore
//! skipped by the walker) unless an explicit cache path is configured.

use super::{FileRecord, Manifest, RemoteNaming};
use crate::fs::walker::{walk_files, FileInfo, WalkOptions};
use crate::{Result, SyncError};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default cache file name, stored at the root of the source tree.
pub const CACHE_FILE_NAME: &str = ".sync-local-manifest.json";

const PROGRESS_LOG_EVERY: usize = 1000;

/// Counters describing one build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub files: usize,
    pub total_bytes: u64,
    /// Files whose content was read and hashed.
    pub hashed: usize,
    /// Files whose checksum was taken from the cache.
    pub reused: usize,
    /// Entries skipped by the walker (unreadable or not regular files).
    pub skipped: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    naming: RemoteNaming,
    cache_path: Option<PathBuf>,
    walk: WalkOptions,
}

impl ManifestBuilder {
    pub fn new(naming: RemoteNaming) -> Self {
        Self {
            naming,
            cache_path: None,
            walk: WalkOptions::default(),
        }
    }

    /// Keep the cache outside the source tree.
    pub fn with_cache_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_path = Some(path.into());
        self
    }

    pub fn cache_path_for(&self, source: &Path) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| source.join(CACHE_FILE_NAME))
    }

    /// Walk `source` and produce its manifest.
    ///
    /// Blocking: call from `spawn_blocking` in async contexts. A file that
    /// cannot be hashed aborts the build with [`SyncError::Build`] naming it.
    pub fn build(
        &self,
        source: &Path,
        owner_id: i64,
        share_name: &str,
        origin_server: &str,
    ) -> Result<(Manifest, BuildStats)> {
        let cache_path = self.cache_path_for(source);
        let cache = match load_cache(&cache_path) {
            Ok(cache) => cache,
            Err(e) => {
                warn!("Ignoring unreadable manifest cache {}: {}", cache_path.display(), e);
                None
            }
        };

        let mut manifest = Manifest::new(owner_id, share_name, origin_server);
        let mut stats = BuildStats::default();

        let summary = walk_files(source, &self.walk, |file: FileInfo| -> Result<()> {
            let cached = cache
                .as_ref()
                .and_then(|c| c.files.get(&file.relative_path))
                .filter(|r| r.size == file.stamp.size && r.modified_at == file.stamp.modified);

            let checksum = match cached {
                Some(record) => {
                    stats.reused += 1;
                    record.checksum.clone()
                }
                None => {
                    stats.hashed += 1;
                    calculate_checksum(&file.path).map_err(|source| SyncError::Build {
                        path: file.relative_path.clone(),
                        source,
                    })?
                }
            };

            stats.files += 1;
            stats.total_bytes += file.stamp.size;
            if stats.files % PROGRESS_LOG_EVERY == 0 {
                info!("Scanned {} files ({} hashed, {} cached)", stats.files, stats.hashed, stats.reused);
            }

            let remote_name = self.naming.remote_name(&file.relative_path);
            manifest.files.insert(
                file.relative_path,
                FileRecord {
                    size: file.stamp.size,
                    modified_at: file.stamp.modified,
                    checksum,
                    remote_name,
                },
            );
            Ok(())
        })?;

        stats.skipped = summary.skipped_errors + summary.skipped_special;

        if let Err(e) = save_cache(&manifest, &cache_path) {
            warn!("Failed to write manifest cache {}: {}", cache_path.display(), e);
        }

        debug!(
            "Built manifest for {}: {} files, {} bytes, {} hashed, {} cached, {} skipped",
            source.display(),
            stats.files,
            stats.total_bytes,
            stats.hashed,
            stats.reused,
            stats.skipped
        );

        Ok((manifest, stats))
    }
}

/// Streaming SHA-256 of a file, tagged `sha256:<hex>`.
pub fn calculate_checksum(path: &Path) -> io::Result<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

/// Load a cached manifest. A missing file is not an error.
pub fn load_cache(path: &Path) -> Result<Option<Manifest>> {
    match fs::read(path) {
        Ok(data) => Ok(Some(Manifest::from_json(&data)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write the cache through a uniquely named temp file in the same directory,
/// so a crash never leaves a torn cache and concurrent writers never share
/// a temp file.
pub fn save_cache(manifest: &Manifest, path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(&manifest.to_json()?)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = fs::OpenOptions::new().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    #[test]
    fn test_build_records_every_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"hello");
        write(dir.path(), "docs/b.txt", b"world!");

        let (manifest, stats) = ManifestBuilder::default()
            .build(dir.path(), 5, "backup", "nas")
            .unwrap();

        assert_eq!(manifest.files.len(), 2);
        assert_eq!(stats.files, 2);
        assert_eq!(stats.hashed, 2);
        assert_eq!(stats.total_bytes, 11);

        let a = &manifest.files["a.txt"];
        assert_eq!(a.size, 5);
        assert_eq!(a.remote_name, "a.txt.enc");
        assert_eq!(
            a.checksum,
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(manifest.files["docs/b.txt"].remote_name, "docs/b.txt.enc");
    }

    #[test]
    fn test_empty_tree() {
        let dir = TempDir::new().unwrap();
        let (manifest, stats) = ManifestBuilder::default()
            .build(dir.path(), 1, "s", "o")
            .unwrap();
        assert!(manifest.files.is_empty());
        assert_eq!(stats, BuildStats::default());
    }

    #[test]
    fn test_cache_file_is_not_part_of_manifest() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a");

        let builder = ManifestBuilder::default();
        builder.build(dir.path(), 1, "s", "o").unwrap();
        assert!(dir.path().join(CACHE_FILE_NAME).exists());

        let (manifest, _) = builder.build(dir.path(), 1, "s", "o").unwrap();
        assert_eq!(manifest.files.keys().collect::<Vec<_>>(), vec!["a.txt"]);
    }

    #[test]
    fn test_unchanged_file_reuses_cached_checksum() {
        let dir = TempDir::new().unwrap();
        let cache = TempDir::new().unwrap();
        let cache_path = cache.path().join("cache.json");
        write(dir.path(), "a.txt", b"first");
        set_mtime(&dir.path().join("a.txt"), 1_700_000_000);

        let builder = ManifestBuilder::default().with_cache_path(&cache_path);
        let (first, _) = builder.build(dir.path(), 1, "s", "o").unwrap();

        // Same size and mtime but different bytes: the cached checksum wins,
        // proving the file was not read again.
        write(dir.path(), "a.txt", b"other");
        set_mtime(&dir.path().join("a.txt"), 1_700_000_000);

        let (second, stats) = builder.build(dir.path(), 1, "s", "o").unwrap();
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.hashed, 0);
        assert_eq!(second.files["a.txt"].checksum, first.files["a.txt"].checksum);
    }

    #[test]
    fn test_changed_mtime_forces_rehash() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"first");
        set_mtime(&dir.path().join("a.txt"), 1_700_000_000);

        let builder = ManifestBuilder::default();
        let (first, _) = builder.build(dir.path(), 1, "s", "o").unwrap();

        write(dir.path(), "a.txt", b"other");
        set_mtime(&dir.path().join("a.txt"), 1_700_000_100);

        let (second, stats) = builder.build(dir.path(), 1, "s", "o").unwrap();
        assert_eq!(stats.hashed, 1);
        assert_ne!(second.files["a.txt"].checksum, first.files["a.txt"].checksum);
    }

    #[test]
    fn test_corrupt_cache_is_ignored() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a");
        fs::write(dir.path().join(CACHE_FILE_NAME), b"{not json").unwrap();

        let (manifest, stats) = ManifestBuilder::default()
            .build(dir.path(), 1, "s", "o")
            .unwrap();
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(stats.hashed, 1);
    }

    #[test]
    fn test_hashed_naming() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "secret/plan.txt", b"x");

        let (manifest, _) = ManifestBuilder::new(RemoteNaming::Hashed)
            .build(dir.path(), 1, "s", "o")
            .unwrap();
        let record = &manifest.files["secret/plan.txt"];
        assert!(!record.remote_name.contains("secret"));
        assert!(record.remote_name.ends_with(".enc"));
    }

    #[test]
    fn test_rebuild_of_unchanged_tree_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.txt", b"bravo");
        write(dir.path(), "a.txt", b"alpha");
        write(dir.path(), "nested/deep/c.txt", b"charlie");

        let builder = ManifestBuilder::default();
        let (first, _) = builder.build(dir.path(), 3, "share", "origin").unwrap();
        let (mut second, stats) = builder.build(dir.path(), 3, "share", "origin").unwrap();
        assert_eq!(stats.reused, 3);

        second.produced_at = first.produced_at;
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
        assert_eq!(
            first.files.keys().collect::<Vec<_>>(),
            vec!["a.txt", "b.txt", "nested/deep/c.txt"]
        );
    }

    #[test]
    fn test_concurrent_cache_writes_leave_one_complete_file() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", b"a");
        let (manifest, _) = ManifestBuilder::default().build(dir.path(), 1, "s", "o").unwrap();
        let cache_path = dir.path().join("state/cache.json");

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let manifest = manifest.clone();
                let cache_path = cache_path.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        save_cache(&manifest, &cache_path).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let loaded = load_cache(&cache_path).unwrap().unwrap();
        assert_eq!(loaded.files, manifest.files);
        let leftovers: Vec<_> = fs::read_dir(cache_path.parent().unwrap()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let result = ManifestBuilder::default().build(&dir.path().join("gone"), 1, "s", "o");
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_aborts_with_its_path() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        write(dir.path(), "locked.bin", b"x");
        let path = dir.path().join("locked.bin");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&path).is_ok() {
            // running with privileges that bypass permission bits
            return;
        }

        let err = ManifestBuilder::default()
            .build(dir.path(), 1, "s", "o")
            .unwrap_err();
        assert!(matches!(err, SyncError::Build { ref path, .. } if path == "locked.bin"));
    }
}
