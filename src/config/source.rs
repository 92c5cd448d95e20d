//! `config::Source` for the middleware's TOML config file.
//!
//! ```toml
//! auth_api_base_url = "https://auth.example.com/v1"   # shared by every instance
//! managed_apis = ["https://api.example.com"]
//!
//! [billing]                                           # overrides for `billing`
//! cache_access_token = true
//! ```
//!
//! Every top-level table is an instance section. Instance sections are flat:
//! a table inside one, a datetime anywhere, or a table inside an array is
//! rejected instead of being dropped, since no config key takes such a value.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use config::{ConfigError, Source, Value, ValueKind};
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum ConfigSourceError {
    #[error("Failed to read file: {0}")]
    FailedToReadFile(PathBuf, std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    FailedToParseTOML(#[from] toml::de::Error),

    #[error("Invalid root, was expecting table")]
    InvalidRootExpectedTable,

    #[error("Invalid instance [{0}], was expecting table")]
    InvalidInstanceExpectedTable(String),

    #[error("Nested table {key} in instance [{instance}] is not supported")]
    NestedInstanceTable { instance: String, key: String },

    #[error("Unsupported {kind} value for key {key}")]
    UnsupportedValue { key: String, kind: &'static str },
}

impl From<ConfigSourceError> for ConfigError {
    fn from(error: ConfigSourceError) -> Self {
        ConfigError::Foreign(Box::new(error))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Section {
    Shared,
    Instance(String),
}

/// One section of a config file: the shared top-level keys, or the table of
/// one named middleware instance.
#[derive(Clone, Debug)]
pub struct FileConfigSource {
    path: PathBuf,
    section: Section,
}

impl FileConfigSource {
    /// The top-level keys, without any instance table.
    pub fn shared(path: impl Into<PathBuf>) -> Self {
        FileConfigSource {
            path: path.into(),
            section: Section::Shared,
        }
    }

    /// The table named `instance`. A file without one yields no keys.
    pub fn instance(path: impl Into<PathBuf>, instance: impl Into<String>) -> Self {
        FileConfigSource {
            path: path.into(),
            section: Section::Instance(instance.into()),
        }
    }

    fn origin(&self) -> String {
        match &self.section {
            Section::Shared => self.path.display().to_string(),
            Section::Instance(name) => format!("{} [{name}]", self.path.display()),
        }
    }

    /// The flat key/value pairs of this source's section.
    fn section_entries(&self, mut root: toml::Table) -> Result<toml::Table, ConfigSourceError> {
        let name = match &self.section {
            Section::Shared => {
                let instances: Vec<String> = root
                    .iter()
                    .filter(|(_, value)| value.is_table())
                    .map(|(key, _)| key.clone())
                    .collect();
                for instance in &instances {
                    root.remove(instance);
                }
                if !instances.is_empty() {
                    debug!(path = %self.path.display(), ?instances, "skipping instance sections");
                }
                return Ok(root);
            }
            Section::Instance(name) => name,
        };

        let table = match root.remove(name) {
            Some(toml::Value::Table(table)) => table,
            Some(_) => {
                return Err(ConfigSourceError::InvalidInstanceExpectedTable(
                    name.clone(),
                ));
            }
            None => {
                debug!(path = %self.path.display(), instance = %name, "no instance section");
                return Ok(toml::Table::new());
            }
        };

        if let Some((key, _)) = table.iter().find(|(_, value)| value.is_table()) {
            return Err(ConfigSourceError::NestedInstanceTable {
                instance: name.clone(),
                key: key.clone(),
            });
        }
        Ok(table)
    }
}

impl Source for FileConfigSource {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new((*self).clone())
    }

    fn collect(&self) -> Result<HashMap<String, Value>, ConfigError> {
        let root = read_root_table(&self.path)?;
        let origin = self.origin();

        let mut values = HashMap::new();
        for (key, value) in self.section_entries(root)? {
            let kind = value_kind_from_toml(&origin, &key, value)?;
            values.insert(key, Value::new(Some(&origin), kind));
        }

        Ok(values)
    }
}

fn read_root_table(path: &Path) -> Result<toml::Table, ConfigSourceError> {
    let file_content = std::fs::read_to_string(path)
        .map_err(|e| ConfigSourceError::FailedToReadFile(path.to_path_buf(), e))?;

    match toml::from_str::<toml::Value>(&file_content)? {
        toml::Value::Table(root) => Ok(root),
        _ => Err(ConfigSourceError::InvalidRootExpectedTable),
    }
}

fn value_kind_from_toml(
    origin: &String,
    key: &str,
    value: toml::Value,
) -> Result<ValueKind, ConfigSourceError> {
    let unsupported = |kind| ConfigSourceError::UnsupportedValue {
        key: key.to_string(),
        kind,
    };

    match value {
        toml::Value::String(s) => Ok(ValueKind::String(s)),
        toml::Value::Integer(i) => Ok(ValueKind::I64(i)),
        toml::Value::Float(f) => Ok(ValueKind::Float(f)),
        toml::Value::Boolean(b) => Ok(ValueKind::Boolean(b)),
        toml::Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                toml::Value::Table(_) => Err(unsupported("table")),
                item => value_kind_from_toml(origin, key, item)
                    .map(|kind| Value::new(Some(origin), kind)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ValueKind::Array),
        toml::Value::Datetime(_) => Err(unsupported("datetime")),
        toml::Value::Table(_) => Err(unsupported("table")),
    }
}
