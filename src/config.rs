//! Archiver configuration.
//!
//! Loaded from a TOML file with a single `[archiver]` table. Every key is
//! optional:
//!
//! ```toml
//! [archiver]
//! cache_root = "/var/cache/dir-archiver"
//! browse_root = "/srv/files"
//! base_url = "https://files.example.org/archives"
//! retention_secs = 86400
//! max_build_secs = 3600
//! wait_timeout_secs = 300
//! poll_interval_ms = 250
//! compression_level = 3
//! max_entries = 100000
//! max_total_bytes = 10737418240
//! ```

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArchiveError, Result};

pub const DEFAULT_BASE_URL: &str = "/archives";
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_MAX_BUILD: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Runtime configuration of an [`Archiver`](crate::Archiver).
#[derive(Debug, Clone)]
pub struct ArchiverConfig {
    /// Root of the artifact, lock and temp directories.
    pub cache_root: PathBuf,
    /// Directories outside this root are treated as inaccessible by the CLI.
    pub browse_root: Option<PathBuf>,
    /// External URL prefix under which `cache_root/archives` is served.
    pub base_url: String,
    /// Artifacts at least this old are removed by the expiry sweep.
    pub retention: Duration,
    /// Lock lifetime; a lock older than this is considered abandoned.
    pub max_build: Duration,
    pub wait_timeout: Duration,
    pub poll_interval: Duration,
    pub compression_level: i32,
    pub max_entries: Option<u64>,
    pub max_total_bytes: Option<u64>,
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            browse_root: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            retention: DEFAULT_RETENTION,
            max_build: DEFAULT_MAX_BUILD,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_entries: None,
            max_total_bytes: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    archiver: Option<ArchiverToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArchiverToml {
    cache_root: Option<PathBuf>,
    browse_root: Option<PathBuf>,
    base_url: Option<String>,
    retention_secs: Option<u64>,
    max_build_secs: Option<u64>,
    wait_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    compression_level: Option<i32>,
    max_entries: Option<u64>,
    max_total_bytes: Option<u64>,
}

impl ArchiverConfig {
    /// Default configuration rooted at `cache_root`.
    pub fn with_cache_root(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            ..Self::default()
        }
    }

    /// Load and validate a TOML configuration file.
    ///
    /// Relative `cache_root`/`browse_root` values are resolved against the
    /// directory containing the file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|err| ArchiveError::Config {
            path: path.to_path_buf(),
            message: format!("reading config: {err}"),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&text, base_dir).map_err(|err| match err {
            ArchiveError::InvalidConfig { message } => ArchiveError::Config {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })
    }

    /// Parse configuration text; relative paths are joined onto `base_dir`.
    pub fn from_toml_str(text: &str, base_dir: &Path) -> Result<Self> {
        let parsed: ConfigToml = toml::from_str(text).map_err(|err| ArchiveError::InvalidConfig {
            message: err.to_string(),
        })?;
        let raw = parsed.archiver.unwrap_or_default();
        let defaults = Self::default();

        let config = Self {
            cache_root: raw
                .cache_root
                .map(|p| resolve_relative(base_dir, p))
                .unwrap_or(defaults.cache_root),
            browse_root: raw.browse_root.map(|p| resolve_relative(base_dir, p)),
            base_url: raw.base_url.unwrap_or(defaults.base_url),
            retention: raw
                .retention_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.retention),
            max_build: raw
                .max_build_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_build),
            wait_timeout: raw
                .wait_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.wait_timeout),
            poll_interval: raw
                .poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            compression_level: raw
                .compression_level
                .unwrap_or(defaults.compression_level),
            max_entries: raw.max_entries,
            max_total_bytes: raw.max_total_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that the rest of the crate relies on.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| ArchiveError::InvalidConfig { message };
        if self.cache_root.as_os_str().is_empty() {
            return Err(invalid("cache_root must not be empty".to_string()));
        }
        if self.max_build.is_zero() {
            return Err(invalid("max_build_secs must be >= 1".to_string()));
        }
        if !(1..=19).contains(&self.compression_level) {
            return Err(invalid(format!(
                "compression_level must be within 1..=19, got {}",
                self.compression_level
            )));
        }
        if self.poll_interval < MIN_POLL_INTERVAL {
            return Err(invalid(format!(
                "poll_interval_ms must be >= {}",
                MIN_POLL_INTERVAL.as_millis()
            )));
        }
        Ok(())
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("dir-archiver")
}

fn resolve_relative(base_dir: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}
