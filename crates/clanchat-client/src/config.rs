//! Client configuration, loaded from RON.
//!
//! ```ron
//! (
//!     connection: (reconnect_base_delay_ms: 500, max_reconnect_attempts: 8),
//!     sync: (page_size: 30),
//!     store: (cache_limit: 100),
//!     database_path: Some("/var/lib/clanchat/messages.db"),
//! )
//! ```
//!
//! Every field is optional; anything left out takes its default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clanchat_store::StoreConfig;
use serde::{Deserialize, Serialize};

use crate::constants::{
    CONNECT_TIMEOUT, DEFAULT_PAGE_SIZE, DEFAULT_SENDER_ID, MAINTENANCE_INTERVAL,
    MAX_RECONNECT_ATTEMPTS, RECONNECT_BASE_DELAY, REQUEST_TIMEOUT,
};

/// Errors loading a config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid config: {0} must be greater than zero")]
    Zero(&'static str),
}

/// Live connection policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub reconnect_base_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay_ms: RECONNECT_BASE_DELAY.as_millis() as u64,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            connect_timeout_ms: CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based):
    /// `base * 2^(attempt - 1)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}

/// Sync controller policy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: usize,
    pub request_timeout_ms: u64,
    pub default_sender_id: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            default_sender_id: DEFAULT_SENDER_ID.to_string(),
        }
    }
}

impl SyncConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Top-level client configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection: ConnectionConfig,
    pub sync: SyncConfig,
    pub store: StoreConfig,
    /// SQLite file backing the cache and outbox. `None` means
    /// [`default_database_path`](Self::default_database_path).
    pub database_path: Option<PathBuf>,
    pub maintenance_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            sync: SyncConfig::default(),
            store: StoreConfig::default(),
            database_path: None,
            maintenance_interval_secs: MAINTENANCE_INTERVAL.as_secs(),
        }
    }
}

impl ClientConfig {
    /// `~/.config/clanchat/client.ron` (platform equivalent).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("clanchat").join("client.ron"))
    }

    /// `~/.local/share/clanchat/messages.db` (platform equivalent), falling
    /// back to the working directory.
    pub fn default_database_path() -> PathBuf {
        dirs::data_local_dir()
            .map(|d| d.join("clanchat"))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("messages.db")
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(Self::default_database_path)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall a timer or an empty page loop.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("sync.page_size", self.sync.page_size as u64),
            ("sync.request_timeout_ms", self.sync.request_timeout_ms),
            ("connection.connect_timeout_ms", self.connection.connect_timeout_ms),
            ("maintenance_interval_secs", self.maintenance_interval_secs),
        ];
        match checks.into_iter().find(|(_, value)| *value == 0) {
            Some((field, _)) => Err(ConfigError::Zero(field)),
            None => Ok(()),
        }
    }

    /// Load from `path`. A missing file yields defaults; a malformed one is
    /// an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_ron(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when
    /// none is given.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.default_sender_id, "current-user");
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.store.cache_limit, 50);
        assert_eq!(config.maintenance_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ConnectionConfig::default();
        let delays: Vec<_> = (1..=5).map(|a| config.backoff_delay(a).as_millis()).collect();
        assert_eq!(delays, [1000, 2000, 4000, 8000, 16000]);
        assert_eq!(config.backoff_delay(200), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_partial_ron_keeps_defaults() {
        let config = ClientConfig::from_ron(
            r#"(
                sync: (page_size: 10),
                store: (cache_limit: 5),
                database_path: Some("/tmp/chat.db"),
            )"#,
        )
        .unwrap();
        assert_eq!(config.sync.page_size, 10);
        assert_eq!(config.sync.default_sender_id, "current-user");
        assert_eq!(config.store.cache_limit, 5);
        assert_eq!(config.store.max_outbox_retries, 3);
        assert_eq!(config.database_path(), PathBuf::from("/tmp/chat.db"));
        assert_eq!(config.connection, ConnectionConfig::default());
    }

    #[test]
    fn test_zero_values_rejected() {
        for text in [
            "(maintenance_interval_secs: 0)",
            "(sync: (page_size: 0))",
            "(sync: (request_timeout_ms: 0))",
        ] {
            assert!(matches!(ClientConfig::from_ron(text), Err(ConfigError::Zero(_))), "{text}");
        }
        assert!(matches!(
            ClientConfig::from_ron("(maintenance_interval_secs: 0)"),
            Err(ConfigError::Zero("maintenance_interval_secs"))
        ));
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig::load(&dir.path().join("absent.ron")).unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.ron");
        std::fs::write(&path, "(sync: (page_size: \"many\"))").unwrap();
        assert!(matches!(ClientConfig::load(&path), Err(ConfigError::Ron(_))));
    }
}
