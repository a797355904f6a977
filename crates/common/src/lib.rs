//! Meshgate Common Library
//!
//! Data model, persistence, signaling relay and trust authority shared by
//! the HTTP surface and the daemon.

pub mod address;
pub mod authority;
pub mod broker;
pub mod db;
pub mod error;
pub mod registry;
pub mod relay;
pub mod types;

// Re-export commonly used types
pub use address::AddressAllocator;
pub use authority::{IssueRequest, IssuedCertificate, TrustAuthority};
pub use broker::{Broker, MemoryBroker, RedisBroker, Subscription};
pub use db::Database;
pub use error::{Error, Result};
pub use registry::{DeviceRegistry, SqliteRegistry};
pub use types::*;

/// Meshgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshgate")
}

/// Default database path
pub fn default_db_path() -> std::path::PathBuf {
    default_store_path().join("state.db")
}

/// Default config path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
