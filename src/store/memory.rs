use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{TokenStore, TokenStoreError};

/// A token store that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    /// Value and deadline; `None` never expires.
    entries: HashMap<String, (String, Option<Instant>)>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        Ok(self
            .entries
            .get(key)
            .filter(|(_, expires_at)| {
                expires_at.is_none_or(|deadline| Instant::now() < deadline)
            })
            .map(|(value, _)| value.clone()))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError> {
        let expires_at = Instant::now().checked_add(ttl);
        self.entries
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), TokenStoreError> {
        self.entries.remove(key);
        Ok(())
    }
}
