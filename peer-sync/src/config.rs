//! Configuration for the sync agent.
//!
//! Loaded from a TOML file; every optional field has a default.

use crate::executor::SyncStrategy;
use crate::fs::paths::is_safe_segment;
use crate::manifest::RemoteNaming;
use crate::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub shares: Vec<ShareConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Name this host publishes to peers; keeps backups from different
    /// origins apart on a shared peer.
    #[serde(default = "default_origin_server")]
    pub origin_server: String,

    /// Working directory for the audit database and keys
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Audit log database (default: `<data_dir>/audit.db`)
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// Per-owner key files (default: `<data_dir>/keys`)
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,

    /// Local manifest caches; when unset each cache lives inside its tree
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Successful uploads between two checkpoint pushes
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,

    /// Encryption chunk size in bytes (default: 1MB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default)]
    pub remote_naming: RemoteNaming,

    /// Time allowed to persist the progress manifest after a failure or
    /// an expired deadline
    #[serde(default = "default_progress_flush_grace_secs")]
    pub progress_flush_grace_secs: u64,

    /// Running audit rows older than this are marked failed at daemon start
    #[serde(default = "default_zombie_after_hours")]
    pub zombie_after_hours: u64,

    /// Cron expression (with seconds) for daemon mode
    #[serde(default = "default_schedule")]
    pub schedule: String,

    /// zstd level for the archive strategy (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub id: i64,
    pub name: String,
    /// Base URL, e.g. `https://peer.example:8443`
    pub url: String,
    /// Shared secret sent as `X-Sync-Password`
    #[serde(default)]
    pub secret: Option<String>,
    /// Attempt deadline; 0 disables it
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub strategy: SyncStrategy,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShareConfig {
    pub owner_id: i64,
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_origin_server() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "peer-sync".to_string())
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/peer-sync")
}

fn default_checkpoint_interval() -> usize {
    500
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_progress_flush_grace_secs() -> u64 {
    30
}

fn default_zombie_after_hours() -> u64 {
    2
}

fn default_schedule() -> String {
    "0 0 * * * *".to_string()
}

fn default_compression_level() -> i32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout_secs() -> u64 {
    2 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            origin_server: default_origin_server(),
            data_dir: default_data_dir(),
            db_path: None,
            keys_dir: None,
            cache_dir: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: default_checkpoint_interval(),
            chunk_size: default_chunk_size(),
            remote_naming: RemoteNaming::default(),
            progress_flush_grace_secs: default_progress_flush_grace_secs(),
            zombie_after_hours: default_zombie_after_hours(),
            schedule: default_schedule(),
            compression_level: default_compression_level(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl AgentConfig {
    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("audit.db"))
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.keys_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("keys"))
    }

    /// Cache file for one share, or `None` to keep it inside the tree.
    pub fn cache_path(&self, share: &ShareConfig) -> Option<PathBuf> {
        self.cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.json", share.owner_id, share.name)))
    }
}

impl PeerConfig {
    /// `None` when the attempt runs without a deadline.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_safe_segment(&self.agent.origin_server) {
            return Err(SyncError::Config(format!(
                "origin_server {:?} must be a single path segment",
                self.agent.origin_server
            )));
        }
        if self.sync.checkpoint_interval == 0 {
            return Err(SyncError::Config("checkpoint_interval must be at least 1".into()));
        }
        if self.sync.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be at least 1".into()));
        }

        let mut peer_ids = HashSet::new();
        for peer in &self.peers {
            if !peer_ids.insert(peer.id) {
                return Err(SyncError::Config(format!("duplicate peer id {}", peer.id)));
            }
            if !peer.url.starts_with("http://") && !peer.url.starts_with("https://") {
                return Err(SyncError::Config(format!(
                    "peer {} url must start with http:// or https://",
                    peer.name
                )));
            }
        }

        let mut shares = HashSet::new();
        for share in &self.shares {
            if !is_safe_segment(&share.name) {
                return Err(SyncError::Config(format!(
                    "share name {:?} must be a single path segment",
                    share.name
                )));
            }
            if !shares.insert((share.owner_id, share.name.as_str())) {
                return Err(SyncError::Config(format!(
                    "duplicate share {} for owner {}",
                    share.name, share.owner_id
                )));
            }
        }
        Ok(())
    }

    pub fn peer(&self, id: i64) -> Option<&PeerConfig> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn share(&self, owner_id: i64, name: &str) -> Option<&ShareConfig> {
        self.shares
            .iter()
            .find(|s| s.owner_id == owner_id && s.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[agent]
origin_server = "nas-paris"
data_dir = "/srv/peer-sync"

[sync]
checkpoint_interval = 100
remote_naming = "hashed"

[[peers]]
id = 1
name = "lyon"
url = "https://lyon.example:8443"
secret = "s3cret"
timeout_secs = 0

[[peers]]
id = 2
name = "cold-storage"
url = "http://10.0.0.9:3000"
strategy = "archive"
enabled = false

[[shares]]
owner_id = 5
name = "backup"
path = "/srv/shares/5/backup"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();

        assert_eq!(config.agent.origin_server, "nas-paris");
        assert_eq!(config.agent.db_path(), PathBuf::from("/srv/peer-sync/audit.db"));
        assert_eq!(config.agent.keys_dir(), PathBuf::from("/srv/peer-sync/keys"));
        assert_eq!(config.sync.checkpoint_interval, 100);
        assert_eq!(config.sync.chunk_size, 1024 * 1024);
        assert_eq!(config.sync.remote_naming, RemoteNaming::Hashed);

        let lyon = config.peer(1).unwrap();
        assert_eq!(lyon.timeout(), None);
        assert_eq!(lyon.strategy, SyncStrategy::Incremental);
        assert!(lyon.enabled);

        let cold = config.peer(2).unwrap();
        assert_eq!(cold.strategy, SyncStrategy::Archive);
        assert_eq!(cold.timeout(), Some(Duration::from_secs(7200)));
        assert!(!cold.enabled);

        let share = config.share(5, "backup").unwrap();
        assert!(share.enabled);
        assert_eq!(config.agent.cache_path(share), None);
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.sync.checkpoint_interval, 500);
        assert_eq!(config.sync.progress_flush_grace_secs, 30);
        assert_eq!(config.log.level, "info");
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_cache_dir_gives_per_share_path() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.agent.cache_dir = Some(PathBuf::from("/var/cache/peer-sync"));
        let share = config.share(5, "backup").unwrap();
        assert_eq!(
            config.agent.cache_path(share),
            Some(PathBuf::from("/var/cache/peer-sync/5_backup.json"))
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.shares[0].name = "../etc".into();
        assert!(matches!(config.validate(), Err(SyncError::Config(_))));

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.peers[1].id = 1;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.sync.checkpoint_interval = 0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.agent.origin_server = "a/b".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("peer-sync.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.shares.len(), 1);
    }
}
