//! Per-owner symmetric keys.

use crate::{Result, SyncError};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Size of encryption keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// An owner's encryption key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_base64(encoded: &str) -> std::result::Result<Self, String> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| format!("invalid base64: {e}"))?,
        );
        if decoded.len() != KEY_SIZE {
            return Err(format!("expected {KEY_SIZE} bytes, got {}", decoded.len()));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&decoded);
        Ok(Self { bytes })
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Looks up the key an owner's data is encrypted with.
pub trait KeyStore: Send + Sync {
    fn key_for(&self, owner_id: i64) -> Result<EncryptionKey>;
}

/// Keys stored one per file as `<dir>/<owner_id>.key`, base64 encoded.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_path(&self, owner_id: i64) -> PathBuf {
        self.dir.join(format!("{owner_id}.key"))
    }

    /// Write a key for `owner_id`, replacing any existing one.
    pub fn store(&self, owner_id: i64, key: &EncryptionKey) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.key_path(owner_id);
        fs::write(&path, key.to_base64())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

impl KeyStore for FileKeyStore {
    fn key_for(&self, owner_id: i64) -> Result<EncryptionKey> {
        let path = self.key_path(owner_id);
        let encoded = Zeroizing::new(fs::read_to_string(&path).map_err(|e| SyncError::KeyLookup {
            owner_id,
            reason: format!("{}: {}", path.display(), e),
        })?);
        EncryptionKey::from_base64(&encoded).map_err(|reason| SyncError::KeyLookup { owner_id, reason })
    }
}

/// In-memory keys, for tests and embedding.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyStore {
    keys: HashMap<i64, EncryptionKey>,
}

impl StaticKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, owner_id: i64, key: EncryptionKey) -> Self {
        self.keys.insert(owner_id, key);
        self
    }
}

impl KeyStore for StaticKeyStore {
    fn key_for(&self, owner_id: i64) -> Result<EncryptionKey> {
        self.keys.get(&owner_id).cloned().ok_or_else(|| SyncError::KeyLookup {
            owner_id,
            reason: "no key registered".to_string(),
        })
    }
}
