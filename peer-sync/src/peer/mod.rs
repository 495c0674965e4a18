//! Peer transport: everything the orchestrator needs from a remote peer.
//!
//! Manifests and file contents are encrypted before they leave the host;
//! the peer only ever stores ciphertext.

pub mod http;

use crate::archive::ArchiveStats;
use crate::crypto::EncryptionKey;
use crate::manifest::Manifest;
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub use http::HttpPeerClient;

/// Header carrying the shared secret.
pub const PASSWORD_HEADER: &str = "X-Sync-Password";
/// Header naming the origin server.
pub const SOURCE_SERVER_HEADER: &str = "X-Source-Server";
/// Name of the encrypted manifest in a backup directory on the peer.
pub const REMOTE_MANIFEST_NAME: &str = ".sync-manifest.json.enc";
/// Name of the unencrypted source metadata in a backup directory on the peer.
pub const SOURCE_INFO_NAME: &str = ".source-info.json";

/// Identifies one backup on a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShareTarget {
    pub owner_id: i64,
    pub share_name: String,
    pub origin_server: String,
}

impl ShareTarget {
    pub fn new(owner_id: i64, share_name: impl Into<String>, origin_server: impl Into<String>) -> Self {
        Self {
            owner_id,
            share_name: share_name.into(),
            origin_server: origin_server.into(),
        }
    }
}

/// Unencrypted metadata published next to a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub source_server: String,
    pub synced_at: chrono::DateTime<chrono::Utc>,
}

/// Calls into a peer. Implementations never retry; every failure is
/// returned as is.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Fetch and decrypt the peer's manifest. `None` when the peer has none.
    async fn fetch_manifest(&self, target: &ShareTarget, key: &EncryptionKey) -> Result<Option<Manifest>>;

    /// Encrypt and store the manifest, replacing the previous one atomically.
    async fn push_manifest(&self, target: &ShareTarget, manifest: &Manifest, key: &EncryptionKey) -> Result<()>;

    /// Stream-encrypt `local_path` to the peer as `remote_name`.
    ///
    /// Returns the number of bytes sent. On cancellation the encryption
    /// producer is joined before [`crate::SyncError::Cancelled`] is returned.
    async fn upload_file(
        &self,
        target: &ShareTarget,
        local_path: &Path,
        remote_name: &str,
        key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<u64>;

    /// Delete one blob. A blob that is already gone is not an error.
    async fn delete_remote_file(&self, target: &ShareTarget, remote_name: &str) -> Result<()>;

    /// Names of every encrypted blob physically stored for `target`.
    async fn list_remote_physical_files(&self, target: &ShareTarget) -> Result<HashSet<String>>;

    async fn put_source_info(&self, target: &ShareTarget, info: &SourceInfo) -> Result<()>;

    /// Send the whole tree as one encrypted archive for the peer to extract.
    async fn upload_archive(
        &self,
        target: &ShareTarget,
        source_dir: &Path,
        key: &EncryptionKey,
        cancel: &CancellationToken,
    ) -> Result<ArchiveStats>;
}
