use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Controls the freshness windows of a [`CacheControl`](crate::CacheControl).
///
/// After a successful fetch a value is *green* for `green_period`, then *red* (stale, but still
/// served while a refresh runs) for another `red_period`. Past both windows the value is no
/// longer served at all, and callers wait for a fresh fetch.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Duration after a successful fetch during which the value is fully fresh.
    #[serde(with = "humantime_serde")]
    pub green_period: Duration,

    /// Additional duration after the green period during which the value is stale, but may
    /// still be served while it is revalidated in the background.
    #[serde(with = "humantime_serde")]
    pub red_period: Duration,

    /// Maximum time to wait for the producer before a fetch fails with a timeout.
    ///
    /// Defaults to `None`, which waits indefinitely.
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl CacheConfig {
    /// The total duration a value remains servable, `green_period + red_period`.
    pub fn cache_validity(&self) -> Duration {
        self.green_period.saturating_add(self.red_period)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            green_period: Duration::from_secs(15),
            red_period: Duration::from_secs(15),
            timeout: None,
        }
    }
}

/// Controls the background [`Sweeper`](crate::Sweeper).
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct SweeperConfig {
    /// How often the cache is scanned.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Remove entries that are no longer servable and have no fetch in flight.
    pub evict_garbage: bool,

    /// Proactively refresh entries that left their green period and are not being refreshed.
    pub refresh_passing: bool,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            evict_garbage: true,
            refresh_passing: false,
        }
    }
}

/// Top-level configuration, as read from a YAML file.
#[derive(Debug, Clone, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Freshness windows and fetch timeout.
    pub cache: CacheConfig,

    /// Background sweeping, see [`Sweeper::from_config`](crate::Sweeper::from_config).
    ///
    /// Without this section no sweeper is created from the configuration.
    pub sweeper: Option<SweeperConfig>,
}

impl Config {
    /// Loads the configuration from `path`, or returns the defaults when no path is given.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let file = fs::File::open(path)
            .with_context(|| format!("failed to open cache config {}", path.display()))?;
        Self::from_reader(file).with_context(|| format!("invalid cache config {}", path.display()))
    }

    fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed to read cache config")?;

        if yaml.trim().is_empty() {
            anyhow::bail!("cache config is empty");
        }
        serde_yaml::from_str(&yaml).context("failed to parse cache config YAML")
    }
}
