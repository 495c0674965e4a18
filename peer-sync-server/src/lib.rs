//! Peer side of peer-sync: stores encrypted mirrors pushed by origin servers.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;

pub use config::AppConfig;
pub use routes::create_router;
pub use state::AppState;
