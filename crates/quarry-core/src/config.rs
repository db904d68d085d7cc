//! quarry.toml configuration parser.
//!
//! Every section is optional. A missing file section falls back to the
//! defaults below, so an empty `quarry.toml` is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuarryConfig {
    pub store: StoreConfig,
    pub search: SearchConfig,
    pub sessions: SessionConfig,
    pub affinity: AffinityConfig,
    pub scoring: Vec<WeigherConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database file. `None` keeps the whole graph in memory.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Hard ceiling applied to every caller-supplied candidate limit.
    pub max_limit: usize,
    /// Default number of roots a single search may explore.
    pub max_roots: usize,
    /// Default number of provider combinations a single search may try.
    pub max_combinations: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_limit: 1000,
            max_roots: 10_000,
            max_combinations: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub default_ttl: String,
    pub max_ttl: String,
    pub max_deltas: usize,
    pub reaper_interval: String,
    /// How long committed, rolled back and expired sessions stay queryable.
    pub retention: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_ttl: "5m".to_string(),
            max_ttl: "1h".to_string(),
            max_deltas: 256,
            reaper_interval: "30s".to_string(),
            retention: "10m".to_string(),
        }
    }
}

impl SessionConfig {
    pub fn default_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration("sessions.default_ttl", &self.default_ttl)
    }

    pub fn max_ttl(&self) -> Result<Duration, ConfigError> {
        parse_duration("sessions.max_ttl", &self.max_ttl)
    }

    pub fn reaper_interval(&self) -> Result<Duration, ConfigError> {
        parse_duration("sessions.reaper_interval", &self.reaper_interval)
    }

    pub fn retention(&self) -> Result<Duration, ConfigError> {
        parse_duration("sessions.retention", &self.retention)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffinityConfig {
    /// Members of an anti-affinity group allowed on one host when the
    /// group itself does not set a limit.
    pub max_server_per_host: u32,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            max_server_per_host: 1,
        }
    }
}

/// One `[[scoring]]` entry: a named weigher and its multiplier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeigherConfig {
    pub name: String,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Per-trait weights, used by `trait_preference`.
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
}

fn default_multiplier() -> f64 {
    1.0
}

impl QuarryConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&content)?;
        Ok(config)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: QuarryConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("search.max_limit", self.search.max_limit)?;
        positive("search.max_roots", self.search.max_roots)?;
        positive("search.max_combinations", self.search.max_combinations)?;
        positive("sessions.max_deltas", self.sessions.max_deltas)?;
        positive(
            "affinity.max_server_per_host",
            self.affinity.max_server_per_host as usize,
        )?;

        let default_ttl = self.sessions.default_ttl()?;
        let max_ttl = self.sessions.max_ttl()?;
        if default_ttl.is_zero() {
            return Err(invalid("sessions.default_ttl", "must be greater than zero"));
        }
        if default_ttl > max_ttl {
            return Err(invalid(
                "sessions.default_ttl",
                "must not exceed sessions.max_ttl",
            ));
        }
        if self.sessions.reaper_interval()?.is_zero() {
            return Err(invalid(
                "sessions.reaper_interval",
                "must be greater than zero",
            ));
        }
        self.sessions.retention()?;

        for weigher in &self.scoring {
            if !weigher.multiplier.is_finite() {
                return Err(invalid(
                    &format!("scoring.{}.multiplier", weigher.name),
                    "must be a finite number",
                ));
            }
        }
        Ok(())
    }
}

/// Parse a duration string such as `"250ms"`, `"30s"`, `"5m"` or `"1h"`.
/// A bare number is read as seconds.
pub fn parse_duration(field: &str, s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let (digits, scale_ms) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1_000)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60_000)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3_600_000)
    } else {
        (s, 1_000)
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| invalid(field, &format!("'{s}' is not a duration")))?;
    value
        .checked_mul(scale_ms)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(field, "duration overflows"))
}

fn positive(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}
