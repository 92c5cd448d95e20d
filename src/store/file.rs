use std::{
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use toml::{Table, Value};

use super::{TokenStore, TokenStoreError, expires_at, is_expired};

/// Token store backed by a TOML file, one table per namespace:
///
/// ```toml
/// [default]
/// access_token = "..."
/// access_token_expires_at = 1767225600
/// ```
pub struct FileTokenStore {
    path: PathBuf,
    namespace: String,
}

impl FileTokenStore {
    pub fn new(path: PathBuf, namespace: impl Into<String>) -> Self {
        Self {
            path,
            namespace: namespace.into(),
        }
    }
}

fn expiry_key(key: &str) -> String {
    format!("{key}_expires_at")
}

impl TokenStore for FileTokenStore {
    fn get(&self, key: &str) -> Result<Option<String>, TokenStoreError> {
        let mut toml_table = get_toml_table(&self.path)?;
        let Some(Value::Table(namespace_table)) = toml_table.remove(&self.namespace) else {
            return Ok(None);
        };

        let Some(value) = try_get_optional_string(&namespace_table, key)? else {
            return Ok(None);
        };

        let expires_at = match namespace_table.get(&expiry_key(key)) {
            Some(Value::Integer(expires_at)) => u64::try_from(*expires_at).unwrap_or(0),
            Some(_) => {
                return Err(TokenStoreError::InvalidStoreFormat {
                    reason: format!("Key {} is not an integer", expiry_key(key)),
                });
            }
            None => return Ok(None),
        };

        if is_expired(expires_at) {
            return Ok(None);
        }

        Ok(Some(value.to_string()))
    }

    fn set(&mut self, key: &str, value: &str, ttl: Duration) -> Result<(), TokenStoreError> {
        let mut toml_table = get_toml_table(&self.path)?;
        let namespace_table = toml_table
            .entry(self.namespace.clone())
            .or_insert(Value::Table(Table::new()));
        let Value::Table(namespace_table) = namespace_table else {
            return Err(TokenStoreError::InvalidStoreFormat {
                reason: format!("Namespace {} is not a table", self.namespace),
            });
        };

        namespace_table.insert(key.to_string(), value.into());
        let expires_at = i64::try_from(expires_at(ttl)).unwrap_or(i64::MAX);
        namespace_table.insert(expiry_key(key), expires_at.into());

        save_toml_table(&self.path, toml_table)
    }

    fn remove(&mut self, key: &str) -> Result<(), TokenStoreError> {
        let mut toml_table = get_toml_table(&self.path)?;
        let Some(Value::Table(namespace_table)) = toml_table.get_mut(&self.namespace) else {
            return Ok(());
        };

        let removed = namespace_table.remove(key).is_some();
        namespace_table.remove(&expiry_key(key));
        if !removed {
            return Ok(());
        }

        save_toml_table(&self.path, toml_table)
    }
}

fn get_toml_table(path: impl AsRef<Path>) -> Result<Table, TokenStoreError> {
    let file_content = match read_to_string(path) {
        Ok(content) => content,
        // No file yet means nothing was cached
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Table::new()),
        Err(e) => {
            return Err(TokenStoreError::StoreUnavailable {
                reason: e.to_string(),
            });
        }
    };

    toml::from_str(&file_content).map_err(|e| TokenStoreError::InvalidStoreFormat {
        reason: e.to_string(),
    })
}

fn try_get_optional_string<'a>(
    table: &'a Table,
    key: &str,
) -> Result<Option<&'a str>, TokenStoreError> {
    let Some(value) = table.get(key) else {
        return Ok(None);
    };

    let Value::String(value) = value else {
        return Err(TokenStoreError::InvalidStoreFormat {
            reason: format!("Key {} is not a string", key),
        });
    };

    Ok(Some(value))
}

fn save_toml_table(path: impl AsRef<Path>, table: Table) -> Result<(), TokenStoreError> {
    let path = path.as_ref();
    let file_content = toml::to_string(&table).map_err(|e| TokenStoreError::Serialization {
        reason: e.to_string(),
    })?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TokenStoreError::StoreUnavailable {
            reason: e.to_string(),
        })?;
    }

    std::fs::write(path, file_content).map_err(|e| TokenStoreError::StoreUnavailable {
        reason: e.to_string(),
    })?;

    Ok(())
}
