use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = ".habitsync/config.toml";
pub const DEFAULT_DB_PATH: &str = ".habitsync/habits.sqlite";
const DEFAULT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub db_path: String,
    pub remote: Option<RemoteConfig>,
    pub sync_interval: Duration,
    pub background_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Values from flags or the environment; each one beats the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub db_path: Option<String>,
    pub remote_url: Option<String>,
    pub api_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfigFile {
    #[serde(default)]
    store: RawStore,
    #[serde(default)]
    remote: RawRemote,
    #[serde(default)]
    sync: RawSync,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStore {
    path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRemote {
    url: Option<String>,
    api_key: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSync {
    interval_secs: Option<u64>,
    background: Option<bool>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl Config {
    /// Reads `path`, or the default location when none is given. Only an
    /// explicitly named file has to exist.
    pub fn load(path: Option<&Path>, overrides: Overrides) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::from_toml(&raw, overrides)
    }

    pub(crate) fn from_toml(raw: &str, overrides: Overrides) -> Result<Self, ConfigError> {
        let file: RawConfigFile = toml::from_str(raw)?;

        let db_path = non_empty(overrides.db_path)
            .or(non_empty(file.store.path))
            .unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let timeout_secs = file.remote.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "remote.timeout_secs must be greater than zero".to_string(),
            ));
        }
        let remote = match non_empty(overrides.remote_url).or(non_empty(file.remote.url)) {
            Some(url) => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Invalid(format!(
                        "remote url '{url}' must start with http:// or https://"
                    )));
                }
                Some(RemoteConfig {
                    url,
                    api_key: non_empty(overrides.api_key).or(non_empty(file.remote.api_key)),
                    timeout: Duration::from_secs(timeout_secs),
                })
            }
            None => None,
        };

        let interval_secs = file.sync.interval_secs.unwrap_or(DEFAULT_INTERVAL_SECS);
        if interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "sync.interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            db_path,
            remote,
            sync_interval: Duration::from_secs(interval_secs),
            background_sync: file.sync.background.unwrap_or(true),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
