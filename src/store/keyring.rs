use std::time::Duration;

use keyring::Entry;

use super::{TokenStore, TokenStoreError, expires_at, is_expired};
use crate::store::encoding::{decode_entry, encode_entry};

/// Token store backed by the OS keychain.
///
/// Each key is one keychain entry in the service `cas-auth_<namespace>`.
pub struct KeyringTokenStore {
    service_name: String,
}

impl KeyringTokenStore {
    pub fn new(namespace: &str) -> Option<Self> {
        let service_name = build_service_name(namespace);

        // Determine if the keyring is available by trying to access a dummy entry
        if Entry::new(&service_name, "dummy").is_ok() {
            Some(Self { service_name })
        } else {
            None
        }
    }

    fn entry(&self, key: &str) -> Result<Entry, TokenStoreError> {
        Entry::new(&self.service_name, key).map_err(|e| TokenStoreError::InvalidStoreFormat {
            reason: e.to_string(),
        })
    }
}

fn build_service_name(namespace: &str) -> String {
    format!("cas-auth_{}", namespace)
}

impl TokenStore for KeyringTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        let password = match self.entry(key)?.get_password() {
            Ok(password) => password,
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => {
                return Err(TokenStoreError::StoreUnavailable {
                    reason: e.to_string(),
                });
            }
        };

        let (value, expires_at) = decode_entry(&password)?;
        if is_expired(expires_at) {
            return Ok(None);
        }

        Ok(Some(value))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError> {
        self.entry(key)?
            .set_password(&encode_entry(value, expires_at(ttl)))
            .map_err(|e| TokenStoreError::StoreUnavailable {
                reason: e.to_string(),
            })
    }

    fn remove(&mut self, key: &str) -> Result<(), TokenStoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(TokenStoreError::StoreUnavailable {
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_name_is_namespaced() {
        assert_eq!(build_service_name("billing"), "cas-auth_billing");
    }
}
