//! Delta computation between a local manifest and the peer's manifest.
//!
//! A path counts as modified when its checksum, size or mtime differs.
//! Size/mtime differences alone are enough: a re-transfer is cheaper than a
//! missed update.

use crate::manifest::{FileRecord, Manifest};

/// Paths to add, update and delete on the peer.
///
/// Each list is sorted; callers must not depend on that order beyond
/// determinism.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub to_add: Vec<String>,
    pub to_update: Vec<String>,
    pub to_delete: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }

    /// Paths to upload: additions first, then updates.
    pub fn uploads(&self) -> impl Iterator<Item = &String> {
        self.to_add.iter().chain(self.to_update.iter())
    }

    pub fn upload_count(&self) -> usize {
        self.to_add.len() + self.to_update.len()
    }
}

/// Partition `local` against `remote`. `None` means the peer has no manifest yet.
pub fn diff(local: &Manifest, remote: Option<&Manifest>) -> Delta {
    let Some(remote) = remote else {
        return Delta {
            to_add: local.files.keys().cloned().collect(),
            ..Delta::default()
        };
    };

    let mut delta = Delta::default();
    for (path, record) in &local.files {
        match remote.files.get(path) {
            None => delta.to_add.push(path.clone()),
            Some(theirs) if is_modified(record, theirs) => delta.to_update.push(path.clone()),
            Some(_) => {}
        }
    }
    delta.to_delete = remote
        .files
        .keys()
        .filter(|path| !local.files.contains_key(*path))
        .cloned()
        .collect();
    delta
}

fn is_modified(ours: &FileRecord, theirs: &FileRecord) -> bool {
    ours.checksum != theirs.checksum || ours.size != theirs.size || ours.modified_at != theirs.modified_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use std::collections::HashSet;

    fn record(size: u64, checksum: &str) -> FileRecord {
        FileRecord {
            size,
            modified_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            checksum: checksum.to_string(),
            remote_name: String::new(),
        }
    }

    fn manifest(files: &[(&str, FileRecord)]) -> Manifest {
        let mut m = Manifest::new(1, "share", "origin");
        for (path, rec) in files {
            let mut rec = rec.clone();
            rec.remote_name = format!("{path}.enc");
            m.files.insert(path.to_string(), rec);
        }
        m
    }

    #[test]
    fn test_first_sync_adds_everything() {
        let local = manifest(&[("a.txt", record(9, "sha256:X"))]);
        let delta = diff(&local, None);
        assert_eq!(delta.to_add, vec!["a.txt"]);
        assert!(delta.to_update.is_empty());
        assert!(delta.to_delete.is_empty());
    }

    #[test]
    fn test_remote_only_path_is_deleted() {
        let local = manifest(&[("a.txt", record(9, "sha256:X"))]);
        let remote = manifest(&[("a.txt", record(9, "sha256:X")), ("b.txt", record(3, "sha256:Y"))]);
        let delta = diff(&local, Some(&remote));
        assert!(delta.to_add.is_empty());
        assert!(delta.to_update.is_empty());
        assert_eq!(delta.to_delete, vec!["b.txt"]);
    }

    #[test]
    fn test_identical_manifests_produce_empty_delta() {
        let local = manifest(&[("a.txt", record(9, "sha256:X")), ("d/b.txt", record(1, "sha256:Y"))]);
        let remote = local.clone();
        assert!(diff(&local, Some(&remote)).is_empty());
    }

    #[test]
    fn test_any_fingerprint_difference_is_an_update() {
        let base = record(9, "sha256:X");

        let mut checksum_only = base.clone();
        checksum_only.checksum = "sha256:Z".into();

        let mut size_only = base.clone();
        size_only.size = 10;

        let mut mtime_only = base.clone();
        mtime_only.modified_at = base.modified_at + Duration::nanoseconds(1);

        let remote = manifest(&[("c", base.clone()), ("s", base.clone()), ("m", base.clone())]);
        let local = manifest(&[("c", checksum_only), ("s", size_only), ("m", mtime_only)]);

        let delta = diff(&local, Some(&remote));
        assert_eq!(delta.to_update, vec!["c", "m", "s"]);
        assert!(delta.to_add.is_empty());
        assert!(delta.to_delete.is_empty());
    }

    #[test]
    fn test_partition_is_complete_and_disjoint() {
        let local = manifest(&[
            ("same", record(1, "sha256:1")),
            ("changed", record(2, "sha256:2")),
            ("new", record(3, "sha256:3")),
        ]);
        let remote = manifest(&[
            ("same", record(1, "sha256:1")),
            ("changed", record(2, "sha256:old")),
            ("gone", record(4, "sha256:4")),
        ]);
        let delta = diff(&local, Some(&remote));

        let added: HashSet<_> = delta.to_add.iter().cloned().collect();
        let updated: HashSet<_> = delta.to_update.iter().cloned().collect();
        assert!(added.is_disjoint(&updated));
        assert_eq!(added, HashSet::from(["new".to_string()]));
        assert_eq!(updated, HashSet::from(["changed".to_string()]));
        assert_eq!(delta.to_delete, vec!["gone"]);

        let uploads: Vec<_> = delta.uploads().cloned().collect();
        assert_eq!(uploads, vec!["new", "changed"]);
        assert_eq!(delta.upload_count(), 2);
    }

    #[test]
    fn test_inputs_are_not_mutated() {
        let local = manifest(&[("a", record(1, "sha256:1"))]);
        let remote = manifest(&[("b", record(1, "sha256:1"))]);
        let (local_before, remote_before) = (local.clone(), remote.clone());
        let _ = diff(&local, Some(&remote));
        assert_eq!(local, local_before);
        assert_eq!(remote, remote_before);
    }
}
