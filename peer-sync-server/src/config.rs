use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    /// Root of the incremental mirrors, `<incoming>/<origin>/<owner>_<share>/`.
    pub incoming_dir: PathBuf,
    /// Root of trees extracted from legacy archives.
    pub archive_dir: PathBuf,
    /// Owner keys, needed only to decrypt legacy archives.
    pub keys_dir: PathBuf,
    /// Shared secret expected in `X-Sync-Password`. Unset disables the check.
    pub password: Option<String>,
    pub log_level: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3000),
            incoming_dir: PathBuf::from(
                std::env::var("INCOMING_DIR").unwrap_or_else(|_| "/backup/data/incoming".into()),
            ),
            archive_dir: PathBuf::from(
                std::env::var("ARCHIVE_DIR").unwrap_or_else(|_| "/backup/data/archives".into()),
            ),
            keys_dir: PathBuf::from(std::env::var("KEYS_DIR").unwrap_or_else(|_| "/backup/data/keys".into())),
            password: std::env::var("SYNC_PASSWORD").ok().filter(|p| !p.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()),
        }
    }
}
