use crate::config::AppConfig;
use peer_sync::crypto::{ChunkedCipher, FileKeyStore};

pub struct AppState {
    pub config: AppConfig,
    pub keys: FileKeyStore,
    pub cipher: ChunkedCipher,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let keys = FileKeyStore::new(config.keys_dir.clone());
        Self {
            config,
            keys,
            cipher: ChunkedCipher::default(),
        }
    }
}
