// src/config.rs

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Address the peer's embedded server listens on while its access point is up.
pub const DEFAULT_HOST: &str = "192.168.0.1";

/// How many `name(i).ext` candidates the store tries before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 99_999;

/// Override value that clears a stored host override.
pub const HOST_OVERRIDE_RESET: &str = "default";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which NetworkLink implementation to use.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkBackend {
    /// Join the peer's access point through NetworkManager.
    Nmcli,
    /// The peer is already reachable; no association is performed.
    Direct,
}

/// Top-level configuration for a transfer session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Number of concurrent background workers.
    pub pool_size: usize,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Total manifest fetch attempts, including the first one.
    pub manifest_attempts: u32,
    /// Backoff step; the n-th retry waits n times this.
    pub retry_backoff_ms: u64,
    /// Bytes between two progress reports of one item.
    pub progress_granularity: u64,
    /// SQLite file holding the saved download state and settings.
    pub state_path: PathBuf,
    pub download_dir: PathBuf,
    pub link: LinkBackend,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            connect_timeout_ms: 3000,
            read_timeout_ms: 5000,
            manifest_attempts: 3,
            retry_backoff_ms: 1000,
            progress_granularity: 100 * 1024, // 100 KiB
            state_path: PathBuf::from("transfer_state.db"),
            download_dir: PathBuf::from("downloads"),
            link: LinkBackend::Nmcli,
        }
    }
}

impl TransferConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be at least 1".into()));
        }
        if self.manifest_attempts == 0 {
            return Err(ConfigError::Invalid("manifest_attempts must be at least 1".into()));
        }
        if self.progress_granularity == 0 {
            return Err(ConfigError::Invalid("progress_granularity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::linear(
            self.manifest_attempts,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

/// Picks the host to fetch the manifest from. An empty override means "use the default".
pub fn resolve_host(host_override: Option<&str>) -> String {
    match host_override.map(str::trim) {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => DEFAULT_HOST.to_string(),
    }
}
