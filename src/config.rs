//! Connection configuration.
//!
//! The engine consumes a flat key-value [`ConnectionConfig`]. A
//! [`ConnectionTemplate`] lists the named fields a connection dialog should
//! offer together with their defaults, and [`ConnectionHistory`] persists the
//! last-used configuration as JSON.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const HOSTS_KEY: &str = "hosts";
pub const TIMEOUT_KEY: &str = "timeout";
pub const AUTH_SCHEME_KEY: &str = "auth_scheme";
pub const AUTH_DATA_KEY: &str = "auth_data";

const DEFAULT_HOSTS: &str = "localhost:2181";
const DEFAULT_TIMEOUT_MS: &str = "5000";

/// Key-value connection settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionConfig {
    values: BTreeMap<String, String>,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Value for `key`, treating empty strings as absent.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    pub fn hosts(&self) -> Option<&str> {
        self.get_non_empty(HOSTS_KEY)
    }

    /// Auth scheme and credentials, if both are set.
    pub fn auth(&self) -> Option<(&str, &str)> {
        Some((
            self.get_non_empty(AUTH_SCHEME_KEY)?,
            self.get_non_empty(AUTH_DATA_KEY)?,
        ))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A named field offered by the connection dialog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateField {
    pub key: String,
    pub label: String,
    pub default: String,
}

/// The set of connection fields with their default values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTemplate {
    fields: Vec<TemplateField>,
}

impl ConnectionTemplate {
    pub fn new(fields: Vec<TemplateField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[TemplateField] {
        &self.fields
    }

    /// A configuration holding every field's default.
    pub fn defaults(&self) -> ConnectionConfig {
        self.fields
            .iter()
            .fold(ConnectionConfig::new(), |cfg, f| cfg.with(&f.key, &f.default))
    }

    /// Fill in defaults for any field `config` leaves unset.
    pub fn complete(&self, config: &ConnectionConfig) -> ConnectionConfig {
        let mut out = self.defaults();
        for (key, value) in config.iter() {
            out.set(key, value);
        }
        out
    }
}

impl Default for ConnectionTemplate {
    fn default() -> Self {
        let field = |key: &str, label: &str, default: &str| TemplateField {
            key: key.to_string(),
            label: label.to_string(),
            default: default.to_string(),
        };
        Self::new(vec![
            field(HOSTS_KEY, "Connect string", DEFAULT_HOSTS),
            field(TIMEOUT_KEY, "Session timeout (ms)", DEFAULT_TIMEOUT_MS),
            field(AUTH_SCHEME_KEY, "Auth scheme", ""),
            field(AUTH_DATA_KEY, "Auth data", ""),
        ])
    }
}

/// Errors emitted by [`ConnectionHistory`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("connection history IO error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid connection history payload: {0}")]
    Invalid(String),
}

/// Persists the last-used connection and the user's default connection.
#[derive(Debug, Clone)]
pub struct ConnectionHistory {
    dir: PathBuf,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryFile {
    #[serde(default)]
    last: Option<ConnectionConfig>,
    #[serde(default)]
    default: Option<ConnectionConfig>,
}

impl ConnectionHistory {
    const FILE_NAME: &'static str = "connections.json";

    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.join(Self::FILE_NAME)
    }

    /// The last configuration used to connect, if any was recorded.
    pub fn last_connection(&self) -> Result<Option<ConnectionConfig>, ConfigError> {
        Ok(self.load()?.last)
    }

    pub fn set_last_connection(&self, config: &ConnectionConfig) -> Result<(), ConfigError> {
        let mut file = self.load()?;
        file.last = Some(config.clone());
        self.store(&file)
    }

    /// The user's saved default connection, falling back to the template.
    pub fn default_connection(
        &self,
        template: &ConnectionTemplate,
    ) -> Result<ConnectionConfig, ConfigError> {
        Ok(match self.load()?.default {
            Some(saved) => template.complete(&saved),
            None => template.defaults(),
        })
    }

    pub fn save_default_connection(&self, config: &ConnectionConfig) -> Result<(), ConfigError> {
        let mut file = self.load()?;
        file.default = Some(config.clone());
        self.store(&file)
    }

    fn load(&self) -> Result<HistoryFile, ConfigError> {
        match fs::read_to_string(self.path()) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|err| ConfigError::Invalid(err.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(HistoryFile::default()),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn store(&self, file: &HistoryFile) -> Result<(), ConfigError> {
        let payload = serde_json::to_vec_pretty(file)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let path = self.path();
        fs::create_dir_all(&self.dir)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_template_defaults_and_completion() {
        let template = ConnectionTemplate::default();
        let defaults = template.defaults();
        assert_eq!(defaults.hosts(), Some("localhost:2181"));
        assert_eq!(defaults.get(TIMEOUT_KEY), Some("5000"));
        assert_eq!(defaults.auth(), None);

        let user = ConnectionConfig::new().with(HOSTS_KEY, "zk1:2181");
        let full = template.complete(&user);
        assert_eq!(full.hosts(), Some("zk1:2181"));
        assert_eq!(full.get(TIMEOUT_KEY), Some("5000"));
    }

    #[test]
    fn test_history_missing_file() {
        let dir = tempdir().unwrap();
        let history = ConnectionHistory::new(dir.path());
        assert!(history.last_connection().unwrap().is_none());
        let default = history
            .default_connection(&ConnectionTemplate::default())
            .unwrap();
        assert_eq!(default.hosts(), Some("localhost:2181"));
    }

    #[test]
    fn test_history_keeps_last_and_default_separately() {
        let dir = tempdir().unwrap();
        let history = ConnectionHistory::new(dir.path().join("nested"));
        let last = ConnectionConfig::new().with(HOSTS_KEY, "a:1");
        let default = ConnectionConfig::new().with(HOSTS_KEY, "b:2");

        history.set_last_connection(&last).unwrap();
        history.save_default_connection(&default).unwrap();

        assert_eq!(history.last_connection().unwrap(), Some(last));
        let loaded = history
            .default_connection(&ConnectionTemplate::default())
            .unwrap();
        assert_eq!(loaded.hosts(), Some("b:2"));
        assert_eq!(loaded.get(TIMEOUT_KEY), Some("5000"));
    }

    #[test]
    fn test_history_rejects_garbage() {
        let dir = tempdir().unwrap();
        let history = ConnectionHistory::new(dir.path());
        fs::write(history.path(), "not json").unwrap();
        assert!(matches!(
            history.last_connection(),
            Err(ConfigError::Invalid(_))
        ));
    }
}
