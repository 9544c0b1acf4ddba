//! Cache configuration.
//!
//! Selects the active store backend, the default TTL for memoized values and
//! the directory root for the file cache. Loaded from an optional file and
//! `RTTP_CACHE__*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_BACKEND: &str = "memory";
const DEFAULT_TTL: &str = "1h";
const DEFAULT_FILE_ROOT: &str = "cache";
const ENV_PREFIX: &str = "RTTP_CACHE";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to build cache configuration: {0}")]
    Build(#[from] config::ConfigError),

    #[error("invalid TTL `{value}` (expected e.g. 500ms, 30s, 5m, 1h, 2d)")]
    InvalidTtl { value: String },
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the store backend to activate in the registry.
    pub backend: String,
    /// Default expiry for memoized values, as a duration string.
    pub default_ttl: String,
    /// Directory under which the file cache stages responses.
    pub file_root: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_owned(),
            default_ttl: DEFAULT_TTL.to_owned(),
            file_root: PathBuf::from(DEFAULT_FILE_ROOT),
        }
    }
}

impl CacheConfig {
    /// Loads configuration: defaults, then `file` when given, then environment
    /// variables prefixed with `RTTP_CACHE__` (e.g. `RTTP_CACHE__DEFAULT_TTL=5m`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigLoadError::Build`] when the file is missing or malformed,
    /// and [`ConfigLoadError::InvalidTtl`] when `default_ttl` does not parse.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigLoadError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config: Self = builder.build()?.try_deserialize()?;
        config.default_ttl()?;
        Ok(config)
    }

    /// Parses the `default_ttl` string.
    pub fn default_ttl(&self) -> Result<Duration, ConfigLoadError> {
        parse_ttl(&self.default_ttl)
    }
}

/// Parse a TTL string such as `"500ms"`, `"30s"`, `"5m"`, `"1h"` or `"1.5d"`.
///
/// A bare number is read as seconds.
pub fn parse_ttl(s: &str) -> Result<Duration, ConfigLoadError> {
    let invalid = || ConfigLoadError::InvalidTtl {
        value: s.to_owned(),
    };

    let trimmed = s.trim();
    let num_end = trimmed
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map_or(trimmed.len(), |(i, _)| i);

    let (num_str, unit) = trimmed.split_at(num_end);
    let num: f64 = num_str.parse().map_err(|_| invalid())?;

    let millis_per_unit = match unit.trim() {
        "ms" => 1.0,
        "" | "s" => 1_000.0,
        "m" => 60.0 * 1_000.0,
        "h" => 60.0 * 60.0 * 1_000.0,
        "d" => 24.0 * 60.0 * 60.0 * 1_000.0,
        _ => return Err(invalid()),
    };

    Duration::try_from_secs_f64(num * millis_per_unit / 1_000.0).map_err(|_| invalid())
}
