//! Server configuration.
//!
//! Limits and options are read once at startup and stay immutable for the
//! lifetime of the process. Keys use the upper-case spelling of the YAML file:
//!
//! ```yaml
//! PORT: 3001
//! GZIP: true
//! MAX_FILE_SIZE_MB: 5
//! UPLOAD_DIR: ./storage/upload
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const MB: usize = 1024 * 1024;

/// Error raised while loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Config {
    pub allow_empty_files: bool,
    pub block_size_kb: usize,
    pub charset: String,
    pub gzip: bool,
    pub keep_extensions: bool,
    pub max_fields: usize,
    pub max_fields_size_total_mb: usize,
    pub max_files: usize,
    pub max_files_size_total_mb: usize,
    pub max_file_size_mb: usize,
    pub port: u16,
    /// Listen backlog.
    pub queue_limit: u32,
    pub upload_dir: PathBuf,

    pub host: String,
    /// Upper bound on connections served at the same time.
    pub max_connections: usize,
    pub read_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub exit_on_accept_error: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allow_empty_files: false,
            block_size_kb: 64,
            charset: "UTF-8".to_string(),
            gzip: true,
            keep_extensions: true,
            max_fields: 60,
            max_fields_size_total_mb: 1,
            max_files: 60,
            max_files_size_total_mb: 60,
            max_file_size_mb: 60,
            port: 3001,
            queue_limit: 1024,
            upload_dir: PathBuf::from("./storage/upload"),
            host: "0.0.0.0".to_string(),
            max_connections: 1024,
            read_timeout_secs: 30,
            request_timeout_secs: 120,
            exit_on_accept_error: false,
        }
    }
}

impl Config {
    /// Loads the file named by `QUAY_CONFIG` (default `quay.yaml`).
    ///
    /// A missing file yields the defaults. `PORT` in the environment
    /// overrides the configured port.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("QUAY_CONFIG").unwrap_or_else(|_| "quay.yaml".to_string());
        let path = Path::new(&path);

        let mut cfg = if path.exists() {
            Self::from_file(path)?
        } else {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Self::default()
        };

        if let Ok(port) = std::env::var("PORT") {
            cfg.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT must be a number"))?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let cfg: Config = serde_yaml::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size_kb == 0 {
            return Err(ConfigError::Invalid("BLOCK_SIZE_KB must be greater than zero"));
        }
        if self.block_size_kb.checked_mul(1024).is_none() {
            return Err(ConfigError::Invalid("BLOCK_SIZE_KB is too large"));
        }
        let quotas = [
            self.max_file_size_mb,
            self.max_files_size_total_mb,
            self.max_fields_size_total_mb,
        ];
        if quotas.iter().any(|mb| mb.checked_mul(MB).is_none()) {
            return Err(ConfigError::Invalid("size quotas are too large"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("MAX_CONNECTIONS must be greater than zero"));
        }
        if self.max_connections > tokio::sync::Semaphore::MAX_PERMITS {
            return Err(ConfigError::Invalid("MAX_CONNECTIONS is too large"));
        }
        if self.read_timeout_secs == 0 || self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero"));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn block_size(&self) -> usize {
        self.block_size_kb.saturating_mul(1024)
    }

    pub fn max_file_size(&self) -> usize {
        self.max_file_size_mb.saturating_mul(MB)
    }

    pub fn max_files_size_total(&self) -> usize {
        self.max_files_size_total_mb.saturating_mul(MB)
    }

    pub fn max_fields_size_total(&self) -> usize {
        self.max_fields_size_total_mb.saturating_mul(MB)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
