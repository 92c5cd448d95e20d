//! Persisted token stores.
//!
//! The middleware keeps its access token in memory; a [`TokenStore`] lets it
//! survive process restarts. Entries carry a time-to-live and read as absent
//! once expired.
//!
//! - [`MemoryTokenStore`]: in-process only, mostly useful for tests.
//! - [`FileTokenStore`]: a TOML file with one table per namespace.
//! - [`KeyringTokenStore`]: the OS keychain.
//!
//! [`get_token_store`] picks the keychain when it is available and falls back
//! to the file store in the platform cache directory.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::path::{GetPathError, token_cache_file};

pub mod encoding;
pub mod file;
pub mod keyring;
pub mod memory;

pub use file::FileTokenStore;
pub use keyring::KeyringTokenStore;
pub use memory::MemoryTokenStore;

#[derive(thiserror::Error, Debug)]
pub enum TokenStoreError {
    #[error("Failed to get cache file path: {0}")]
    FailedToGetCacheFilePath(#[from] GetPathError),
    #[error("Token store unavailable: {reason}")]
    StoreUnavailable { reason: String },
    #[error("Invalid token store format: {reason}")]
    InvalidStoreFormat { reason: String },
    #[error("Failed to serialize token store: {reason}")]
    Serialization { reason: String },
}

/// Key-value store for persisted tokens.
#[cfg_attr(test, mockall::automock)]
pub trait TokenStore: Send + Sync {
    /// Read a value, `None` when it is missing or expired.
    fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError>;
    fn set(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError>;
    fn remove(&mut self, key: &str) -> Result<(), TokenStoreError>;
}

/// Open the default token store for a namespace (one namespace per middleware instance).
pub fn get_token_store(namespace: &str) -> Result<Box<dyn TokenStore>, TokenStoreError> {
    match KeyringTokenStore::new(namespace) {
        Some(keyring_store) => Ok(Box::new(keyring_store) as Box<dyn TokenStore>),
        None => Ok(Box::new(FileTokenStore::new(token_cache_file()?, namespace))),
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Absolute expiry, in unix seconds, of an entry written now.
pub(crate) fn expires_at(ttl: Duration) -> u64 {
    unix_now().saturating_add(ttl.as_secs())
}

pub(crate) fn is_expired(expires_at: u64) -> bool {
    unix_now() >= expires_at
}
