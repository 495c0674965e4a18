//! Runs configured (share, peer) pairs through the sync engine.

use crate::config::{Config, PeerConfig, ShareConfig};
use crate::crypto::ChunkedCipher;
use crate::executor::{SyncEngine, SyncReport, SyncRequest, SyncStrategy};
use crate::peer::{HttpPeerClient, PeerTransport};
use crate::{Result, SyncError};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug)]
pub enum PairOutcome {
    Synced(SyncReport),
    /// Another attempt held the pair's lock.
    Skipped,
    Failed(SyncError),
}

#[derive(Debug)]
pub struct PairResult {
    pub owner_id: i64,
    pub share_name: String,
    pub peer_id: i64,
    pub outcome: PairOutcome,
}

pub struct SyncRunner {
    config: Arc<Config>,
    engine: Arc<SyncEngine>,
    transports: HashMap<i64, Arc<dyn PeerTransport>>,
}

impl SyncRunner {
    /// One HTTP transport per enabled peer.
    pub fn from_config(config: Arc<Config>, engine: Arc<SyncEngine>) -> Result<Self> {
        let cipher = ChunkedCipher::new(config.sync.chunk_size);
        let mut transports: HashMap<i64, Arc<dyn PeerTransport>> = HashMap::new();
        for peer in config.peers.iter().filter(|p| p.enabled) {
            let client = HttpPeerClient::new(peer, cipher, config.sync.compression_level)?;
            transports.insert(peer.id, Arc::new(client));
        }
        Ok(Self {
            config,
            engine,
            transports,
        })
    }

    /// Replace the transport used for `peer_id`.
    pub fn with_transport(mut self, peer_id: i64, transport: Arc<dyn PeerTransport>) -> Self {
        self.transports.insert(peer_id, transport);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn request_for(&self, share: &ShareConfig, peer: &PeerConfig) -> SyncRequest {
        SyncRequest {
            owner_id: share.owner_id,
            share_name: share.name.clone(),
            source_dir: share.path.clone(),
            origin_server: self.config.agent.origin_server.clone(),
            peer_id: peer.id,
            timeout: peer.timeout(),
            cache_path: self.config.agent.cache_path(share),
        }
    }

    /// Sync one pair. `strategy` overrides the peer's configured strategy.
    pub async fn run_pair(
        &self,
        share: &ShareConfig,
        peer: &PeerConfig,
        strategy: Option<SyncStrategy>,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let transport = self
            .transports
            .get(&peer.id)
            .ok_or_else(|| SyncError::Config(format!("peer {} ({}) is not enabled", peer.id, peer.name)))?;
        let request = self.request_for(share, peer);
        self.engine
            .run(transport.as_ref(), &request, strategy.unwrap_or(peer.strategy), cancel)
            .await
    }

    /// Sync every enabled share to every enabled peer, one pair at a time.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Vec<PairResult> {
        let mut results = Vec::new();
        for share in self.config.shares.iter().filter(|s| s.enabled) {
            for peer in self.config.peers.iter().filter(|p| p.enabled) {
                if cancel.is_cancelled() {
                    return results;
                }
                let outcome = match self.run_pair(share, peer, None, cancel).await {
                    Ok(report) => PairOutcome::Synced(report),
                    Err(e) if e.is_already_running() => {
                        info!(
                            owner_id = share.owner_id,
                            peer_id = peer.id,
                            share = %share.name,
                            "Skipping pair: sync already running"
                        );
                        PairOutcome::Skipped
                    }
                    Err(e) => {
                        error!(
                            owner_id = share.owner_id,
                            peer_id = peer.id,
                            share = %share.name,
                            error = %e,
                            "Sync failed"
                        );
                        PairOutcome::Failed(e)
                    }
                };
                results.push(PairResult {
                    owner_id: share.owner_id,
                    share_name: share.name.clone(),
                    peer_id: peer.id,
                    outcome,
                });
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::crypto::StaticKeyStore;
    use crate::executor::SyncSettings;

    fn config() -> Config {
        let mut config: Config = toml::from_str(
            r#"
            [agent]
            origin_server = "origin-a"
            cache_dir = "/var/cache/peer-sync"

            [[peers]]
            id = 7
            name = "offsite"
            url = "http://127.0.0.1:9"
            timeout_secs = 0

            [[peers]]
            id = 8
            name = "retired"
            url = "http://127.0.0.1:9"
            enabled = false

            [[shares]]
            owner_id = 1
            name = "docs"
            path = "/srv/shares/1/docs"
            "#,
        )
        .unwrap();
        config.shares.push(ShareConfig {
            owner_id: 2,
            name: "old".to_string(),
            path: "/srv/shares/2/old".into(),
            enabled: false,
        });
        config
    }

    fn runner() -> SyncRunner {
        let engine = SyncEngine::new(
            Arc::new(MemoryAuditLog::new()),
            Arc::new(StaticKeyStore::new()),
            SyncSettings::default(),
        );
        SyncRunner::from_config(Arc::new(config()), Arc::new(engine)).unwrap()
    }

    #[test]
    fn test_request_for_uses_agent_settings() {
        let runner = runner();
        let config = runner.config();
        let request = runner.request_for(&config.shares[0], &config.peers[0]);
        assert_eq!(request.origin_server, "origin-a");
        assert_eq!(request.peer_id, 7);
        assert_eq!(request.timeout, None);
        assert_eq!(
            request.cache_path.unwrap(),
            std::path::PathBuf::from("/var/cache/peer-sync/1_docs.json")
        );
    }

    #[tokio::test]
    async fn test_busy_pairs_are_skipped() {
        let runner = runner();
        let _held = runner.engine().locks().try_acquire(1, 7).unwrap();

        let results = runner.run_all(&CancellationToken::new()).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].peer_id, 7);
        assert!(matches!(results[0].outcome, PairOutcome::Skipped));
    }

    #[tokio::test]
    async fn test_disabled_peer_is_rejected() {
        let runner = runner();
        let config = runner.config();
        let err = runner
            .run_pair(&config.shares[0], &config.peers[1], None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancelled_run_does_nothing() {
        let runner = runner();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(runner.run_all(&cancel).await.is_empty());
    }
}
