//! Configuration management for qflow.
//!
//! This module handles loading, saving, and managing qflow configuration.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/qflow/config.toml` |
//! | macOS | `~/Library/Application Support/qflow/config.toml` |
//! | Windows | `%APPDATA%\qflow\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use qflow_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Chunk size: {}", config.transfer.chunk_size);
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const GIB: u64 = 1024 * 1024 * 1024;

/// Main configuration struct for qflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings
    pub server: ServerConfig,
    /// Storage settings
    pub storage: StorageConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Session lifecycle settings
    pub session: SessionConfig,
}

/// HTTP server configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind to localhost only
    pub localhost_only: bool,
    /// Base URL of the byte transport handed out to clients
    pub transport_url: String,
    /// Answer cross-origin requests
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            localhost_only: false,
            transport_url: "quic://localhost:4242".to_string(),
            cors: true,
        }
    }
}

impl ServerConfig {
    /// Get the bind address for the server.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        if self.localhost_only {
            SocketAddr::from(([127, 0, 0, 1], self.port))
        } else {
            SocketAddr::from(([0, 0, 0, 0], self.port))
        }
    }
}

/// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory published files land in
    pub root: PathBuf,
    /// Directory for staging files of in-progress uploads
    pub temp_dir: PathBuf,
    /// Directory for persisted session records and the file catalog
    pub state_dir: PathBuf,
    /// Total bytes the storage root may hold
    pub quota: u64,
    /// Largest single file accepted
    pub max_file_size: u64,
    /// Sub-directory template for uploads without an explicit path
    pub path_template: String,
    /// Days a published file is kept (0 keeps files forever)
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = Config::data_dir().unwrap_or_else(|| PathBuf::from(".qflow"));
        Self {
            root: data_dir.join("files"),
            temp_dir: std::env::temp_dir().join("qflow-upload"),
            state_dir: data_dir.join("state"),
            quota: 1024 * GIB,
            max_file_size: 10 * GIB,
            path_template: "{date}".to_string(),
            retention_days: 30,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Preferred chunk size in bytes
    pub chunk_size: u64,
    /// Smallest chunk size negotiated for small files
    pub min_chunk_size: u64,
    /// Largest chunk size negotiated for huge files
    pub max_chunk_size: u64,
    /// Upper bound on the number of chunks per file before chunks grow
    pub max_chunks: u64,
    /// Retries a client should attempt per chunk
    pub max_retries: u32,
    /// Upload timeout advertised to clients
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Download timeout advertised to clients
    #[serde(with = "humantime_serde")]
    pub download_timeout: Duration,
    /// Default concurrent chunk operations per task
    pub threads: usize,
    /// Largest per-task concurrency a client may request
    pub max_threads: usize,
    /// Verify whole-file digests unless a request opts out
    pub verify_checksum: bool,
    /// Allow tasks to resume from previously recorded coverage
    pub resume_support: bool,
    /// Maximum number of active tasks across the server
    pub max_concurrent_transfers: usize,
    /// Retries of transient storage I/O before giving up
    pub io_retries: u32,
    /// Delay between storage I/O retries
    #[serde(with = "humantime_serde")]
    pub io_retry_delay: Duration,
    /// Width of the sliding window used for speed estimates
    #[serde(with = "humantime_serde")]
    pub speed_window: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            min_chunk_size: crate::MIN_CHUNK_SIZE,
            max_chunk_size: crate::MAX_CHUNK_SIZE,
            max_chunks: 10_000,
            max_retries: 3,
            timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(600),
            threads: crate::DEFAULT_THREADS,
            max_threads: 16,
            verify_checksum: true,
            resume_support: true,
            max_concurrent_transfers: 100,
            io_retries: 3,
            io_retry_delay: Duration::from_millis(50),
            speed_window: Duration::from_secs(5),
        }
    }
}

/// Session lifecycle configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle time after which an active task expires
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Interval of the background sweeper
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long finished tasks stay queryable
    #[serde(with = "humantime_serde")]
    pub history_retention: Duration,
    /// Persist upload sessions so they survive restarts
    pub persist: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(60),
            history_retention: Duration::from_secs(60 * 60),
            persist: true,
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, falling back to defaults when absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized or written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigError`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.min_chunk_size == 0 || t.min_chunk_size > t.max_chunk_size {
            return Err(Error::ConfigError(
                "transfer.min_chunk_size must be non-zero and <= transfer.max_chunk_size".into(),
            ));
        }
        if t.chunk_size < t.min_chunk_size || t.chunk_size > t.max_chunk_size {
            return Err(Error::ConfigError(
                "transfer.chunk_size must lie within [min_chunk_size, max_chunk_size]".into(),
            ));
        }
        if t.threads == 0 || t.max_threads < t.threads {
            return Err(Error::ConfigError(
                "transfer.threads must be >= 1 and <= transfer.max_threads".into(),
            ));
        }
        if t.max_chunks == 0 {
            return Err(Error::ConfigError("transfer.max_chunks must be >= 1".into()));
        }
        Ok(())
    }

    /// Get the configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "qflow", "qflow")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the data directory path.
    #[must_use]
    pub fn data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "qflow", "qflow")
            .map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }

    /// Build a configuration rooted entirely under `base`.
    ///
    /// Handy for tests and for running a throwaway server.
    #[must_use]
    pub fn rooted_at(base: &Path) -> Self {
        let mut config = Self::default();
        config.storage.root = base.join("files");
        config.storage.temp_dir = base.join("tmp");
        config.storage.state_dir = base.join("state");
        config
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let s = s.trim();

        let parse = |digits: &str, unit: u64, millis: bool| -> Result<Duration, D::Error> {
            digits
                .trim()
                .parse::<u64>()
                .map(|n| {
                    if millis {
                        Duration::from_millis(n * unit)
                    } else {
                        Duration::from_secs(n * unit)
                    }
                })
                .map_err(serde::de::Error::custom)
        };

        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms, 1, true)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs, 1, false)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse(mins, 60, false)
        } else if let Some(hours) = s.strip_suffix('h') {
            parse(hours, 3600, false)
        } else {
            Err(serde::de::Error::custom("invalid duration format"))
        }
    }
}
