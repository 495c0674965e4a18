//! Manifest types.
//!
//! A manifest fingerprints one owner's share tree: every file's size, mtime,
//! plaintext checksum and the name its encrypted blob is stored under on the
//! peer. The JSON shape is the wire format exchanged (encrypted) with peers
//! and the format of the local cache file.

pub mod builder;

use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

pub use builder::{BuildStats, ManifestBuilder};

/// Current manifest format version.
pub const MANIFEST_FORMAT_VERSION: u32 = 1;

/// Suffix carried by every encrypted blob stored on a peer.
pub const ENCRYPTED_SUFFIX: &str = ".enc";

/// Sync state of a single file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub size: u64,
    #[serde(rename = "mtime")]
    pub modified_at: DateTime<Utc>,
    /// Algorithm-tagged digest of the plaintext, e.g. `sha256:<hex>`.
    pub checksum: String,
    /// Name of the encrypted blob on the peer, derived from the path only.
    #[serde(rename = "encrypted_path")]
    pub remote_name: String,
}

/// Fingerprint of one owner/share tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "version")]
    pub format_version: u32,
    #[serde(rename = "last_sync")]
    pub produced_at: DateTime<Utc>,
    #[serde(rename = "user_id")]
    pub owner_id: i64,
    pub share_name: String,
    /// Server that produced the backup, keeps origins apart on shared peers.
    #[serde(rename = "source_server")]
    pub origin_server: String,
    #[serde(default)]
    pub files: BTreeMap<String, FileRecord>,
}

impl Manifest {
    pub fn new(owner_id: i64, share_name: &str, origin_server: &str) -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            produced_at: Utc::now(),
            owner_id,
            share_name: share_name.to_string(),
            origin_server: origin_server.to_string(),
            files: BTreeMap::new(),
        }
    }

    /// Starting point of a progress manifest: this attempt's header with the
    /// files the peer already holds.
    pub fn progress_from(remote: Option<&Manifest>, owner_id: i64, share_name: &str, origin_server: &str) -> Self {
        let mut progress = Self::new(owner_id, share_name, origin_server);
        if let Some(remote) = remote {
            progress.files = remote.files.clone();
        }
        progress
    }

    pub fn touch(&mut self) {
        self.produced_at = Utc::now();
    }

    /// Serialize to the indented JSON wire format.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Number of files and their total plaintext size.
    pub fn stats(&self) -> (usize, u64) {
        (self.files.len(), self.files.values().map(|r| r.size).sum())
    }

    pub fn remote_names(&self) -> HashSet<&str> {
        self.files.values().map(|r| r.remote_name.as_str()).collect()
    }
}

/// How a relative path maps onto the blob name stored on the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteNaming {
    /// `docs/a.txt` -> `docs/a.txt.enc`
    #[default]
    Suffix,
    /// `docs/a.txt` -> `<sha256 of the path>.enc`, hides the tree layout
    Hashed,
}

impl RemoteNaming {
    pub fn remote_name(&self, relative_path: &str) -> String {
        match self {
            RemoteNaming::Suffix => format!("{relative_path}{ENCRYPTED_SUFFIX}"),
            RemoteNaming::Hashed => {
                let digest = Sha256::digest(relative_path.as_bytes());
                format!("{}{ENCRYPTED_SUFFIX}", hex::encode(digest))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record(size: u64, checksum: &str, remote_name: &str) -> FileRecord {
        FileRecord {
            size,
            modified_at: Utc.timestamp_opt(1_700_000_000, 987_654_321).unwrap(),
            checksum: checksum.to_string(),
            remote_name: remote_name.to_string(),
        }
    }

    #[test]
    fn test_json_round_trip_keeps_every_field() {
        let mut manifest = Manifest::new(5, "backup", "nas-paris");
        manifest.files.insert("docs/a.txt".into(), record(9, "sha256:aa", "docs/a.txt.enc"));
        manifest.files.insert("b.bin".into(), record(0, "sha256:bb", "b.bin.enc"));

        let parsed = Manifest::from_json(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_wire_field_names() {
        let mut manifest = Manifest::new(5, "backup", "nas-paris");
        manifest.files.insert("a.txt".into(), record(9, "sha256:aa", "a.txt.enc"));

        let value: serde_json::Value = serde_json::from_slice(&manifest.to_json().unwrap()).unwrap();
        assert_eq!(value["version"], 1);
        assert_eq!(value["user_id"], 5);
        assert_eq!(value["source_server"], "nas-paris");
        assert_eq!(value["files"]["a.txt"]["encrypted_path"], "a.txt.enc");
        assert!(value["files"]["a.txt"]["mtime"].is_string());
    }

    #[test]
    fn test_progress_from_copies_remote_files_only() {
        let mut remote = Manifest::new(5, "backup", "old-name");
        remote.files.insert("a.txt".into(), record(1, "sha256:aa", "a.txt.enc"));

        let progress = Manifest::progress_from(Some(&remote), 5, "backup", "nas-paris");
        assert_eq!(progress.origin_server, "nas-paris");
        assert_eq!(progress.files, remote.files);

        let fresh = Manifest::progress_from(None, 5, "backup", "nas-paris");
        assert!(fresh.files.is_empty());
    }

    #[test]
    fn test_remote_naming() {
        assert_eq!(RemoteNaming::Suffix.remote_name("docs/a.txt"), "docs/a.txt.enc");

        let hashed = RemoteNaming::Hashed.remote_name("docs/a.txt");
        assert!(hashed.ends_with(".enc"));
        assert!(!hashed.contains("docs"));
        assert_eq!(hashed, RemoteNaming::Hashed.remote_name("docs/a.txt"));
        assert_ne!(hashed, RemoteNaming::Hashed.remote_name("docs/b.txt"));
    }

    #[test]
    fn test_stats() {
        let mut manifest = Manifest::new(1, "s", "o");
        manifest.files.insert("a".into(), record(10, "sha256:a", "a.enc"));
        manifest.files.insert("b".into(), record(32, "sha256:b", "b.enc"));
        assert_eq!(manifest.stats(), (2, 42));
    }
}
