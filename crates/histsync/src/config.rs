//! Configuration for histsync runs.
//!
//! Resolution order: built-in defaults, then a TOML file, then command line
//! flags (applied by the binary).

use crate::fetch::FetchSettings;
use crate::load::{LoadSettings, DEFAULT_BATCH_SIZE};
use crate::lock::DEFAULT_STALE_AFTER_MINUTES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Environment variable overriding the histsync home directory.
pub const HOME_ENV: &str = "HISTSYNC_HOME";
/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "HISTSYNC_CONFIG";

pub const DEFAULT_RETENTION_DAYS: u32 = 10;
pub const DEFAULT_FILE_SUFFIX: &str = ".csv";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("No remote directory configured (set remote_dir or pass --remote-dir)")]
    MissingRemoteDir,
}

/// Resolve the histsync home directory.
///
/// Priority:
/// 1) HISTSYNC_HOME
/// 2) ~/.histsync
/// 3) ./.histsync
pub fn histsync_home() -> PathBuf {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .map(|h| h.join(".histsync"))
        .unwrap_or_else(|| PathBuf::from(".").join(".histsync"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Historian export directory. Required to run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,

    /// Per-tag cache files.
    pub cache_dir: PathBuf,

    /// Downloads in flight; swept after every fetch.
    pub staging_dir: PathBuf,

    pub lock_path: PathBuf,

    /// DuckDB database file.
    pub database: PathBuf,

    /// Data file names end with this; the rest is the tag.
    pub file_suffix: String,

    /// Cache rows older than this many days are dropped on merge.
    pub retention_days: u32,

    /// Age after which a lock record is considered abandoned.
    pub stale_lock_minutes: u32,

    /// Rows per committed insert batch.
    pub batch_size: usize,

    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::for_home(&histsync_home())
    }
}

impl Config {
    /// Defaults with every path under `home`.
    pub fn for_home(home: &Path) -> Self {
        Self {
            remote_dir: None,
            cache_dir: home.join("cache"),
            staging_dir: home.join("staging"),
            lock_path: home.join("transfer.lock"),
            database: home.join("historian.duckdb"),
            file_suffix: DEFAULT_FILE_SUFFIX.to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            stale_lock_minutes: DEFAULT_STALE_AFTER_MINUTES as u32,
            batch_size: DEFAULT_BATCH_SIZE,
            log_dir: home.join("logs"),
        }
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Find and load the config file, if any.
    ///
    /// An explicit path or `HISTSYNC_CONFIG` must exist; `<home>/config.toml`
    /// is used only when present. Returns the file that was read.
    pub fn resolve(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let chosen = explicit
            .map(Path::to_path_buf)
            .or_else(|| {
                std::env::var_os(CONFIG_ENV)
                    .filter(|v| !v.is_empty())
                    .map(PathBuf::from)
            });
        if let Some(path) = chosen {
            return Ok((Self::load(&path)?, Some(path)));
        }

        let default_path = histsync_home().join("config.toml");
        if default_path.is_file() {
            return Ok((Self::load(&default_path)?, Some(default_path)));
        }
        Ok((Self::default(), None))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.retention_days == 0 {
            return Err(ConfigError::Invalid(
                "retention_days must be at least 1".into(),
            ));
        }
        if self.stale_lock_minutes == 0 {
            return Err(ConfigError::Invalid(
                "stale_lock_minutes must be at least 1".into(),
            ));
        }
        if self.file_suffix.is_empty() {
            return Err(ConfigError::Invalid("file_suffix must not be empty".into()));
        }
        if self.remote_dir.as_deref() == Some("") {
            return Err(ConfigError::Invalid("remote_dir must not be empty".into()));
        }
        // The fetch sweep deletes staged files, so nothing else may live there.
        for (key, path) in [
            ("cache_dir", &self.cache_dir),
            ("database", &self.database),
            ("lock_path", &self.lock_path),
            ("log_dir", &self.log_dir),
        ] {
            if path.starts_with(&self.staging_dir) {
                return Err(ConfigError::Invalid(format!(
                    "staging_dir {} must not contain {} ({})",
                    self.staging_dir.display(),
                    key,
                    path.display()
                )));
            }
        }
        Ok(())
    }

    pub fn remote_dir(&self) -> Result<&str, ConfigError> {
        self.remote_dir
            .as_deref()
            .ok_or(ConfigError::MissingRemoteDir)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retention_days))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.stale_lock_minutes))
    }

    pub fn fetch_settings(&self) -> Result<FetchSettings, ConfigError> {
        Ok(FetchSettings {
            remote_dir: self.remote_dir()?.to_string(),
            staging_dir: self.staging_dir.clone(),
            cache_dir: self.cache_dir.clone(),
            file_suffix: self.file_suffix.clone(),
            retention: self.retention(),
        })
    }

    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            cache_dir: self.cache_dir.clone(),
            file_suffix: self.file_suffix.clone(),
            batch_size: self.batch_size,
        }
    }
}
