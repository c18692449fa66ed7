//! Service configuration loaded from YAML.

use crate::delta::{ScopePolicy, DEFAULT_LOOKBACK};
use crate::store::StoreConfig;
use crate::types::EntityType;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration. Every section and field has a default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub server: ServerConfig,
    pub store: StoreSection,
    pub feed: FeedConfig,
    pub retention: RetentionConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    /// Fsync the log every N commits.
    pub sync_interval: u64,
    pub lock_timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        let defaults = StoreConfig::default();
        Self {
            path: defaults.path,
            sync_interval: defaults.sync_interval,
            lock_timeout_ms: defaults.lock_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Window served to callers with neither cursor nor since.
    pub default_lookback_hours: u64,

    /// Entity types visible to non-privileged callers.
    pub allow_list: Vec<EntityType>,

    /// Roles that may filter the feed by arbitrary entity types.
    pub privileged_roles: Vec<String>,

    /// Request header carrying the caller's role.
    pub role_header: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        let mut allow_list: Vec<_> = ScopePolicy::default().allow_list().iter().copied().collect();
        allow_list.sort();
        Self {
            default_lookback_hours: DEFAULT_LOOKBACK.as_secs() / 3600,
            allow_list,
            privileged_roles: vec!["admin".to_string(), "leader".to_string()],
            role_header: "x-sync-role".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: 90,
            interval_secs: 3600,
        }
    }
}

impl RetentionConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// `json` or `text`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

impl SyncConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            None => Self::default(),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.sync_interval == 0 {
            return Err(ConfigError::Invalid("store.sync_interval must be >= 1".into()));
        }
        if self.retention.enabled && self.retention.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "retention.retention_days must be >= 1".into(),
            ));
        }
        if self.retention.enabled && self.retention.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "retention.interval_secs must be >= 1".into(),
            ));
        }
        if self.feed.role_header.trim().is_empty() {
            return Err(ConfigError::Invalid("feed.role_header must not be empty".into()));
        }
        Ok(())
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.store.path.clone(),
            sync_interval: self.store.sync_interval,
            lock_timeout: Duration::from_millis(self.store.lock_timeout_ms),
            create_if_missing: true,
        }
    }

    pub fn scope_policy(&self) -> ScopePolicy {
        ScopePolicy::new(self.feed.allow_list.iter().copied())
    }

    pub fn default_lookback(&self) -> Duration {
        Duration::from_secs(self.feed.default_lookback_hours.saturating_mul(60 * 60))
    }
}
