//! Peer Sync Library
//!
//! Incremental, encrypted, resumable mirroring of share directories onto
//! peer servers, with a legacy full-archive strategy.

pub mod archive;
pub mod audit;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod executor;
pub mod fs;
pub mod manifest;
pub mod peer;
pub mod sync;
pub mod transfer;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use executor::{SyncEngine, SyncReport, SyncRequest, SyncStrategy};
pub use utils::{Result, SyncError};
