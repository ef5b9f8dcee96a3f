use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use firewatch_core::FirewatchError;
use firewatch_ingest::FirmsConfig;
use serde::{Deserialize, Serialize};

/// Slot key under which the encoded store image is kept.
pub const DEFAULT_SNAPSHOT_KEY: &str = "wildfire_sqlite_db_v2";

/// Runtime configuration for a [`crate::Firewatch`] instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FirewatchConfig {
    /// Directory of the file-backed snapshot slot. Without one, snapshots live in
    /// process memory only.
    pub snapshot_dir: Option<PathBuf>,
    pub snapshot_quota_bytes: Option<u64>,
    pub snapshot_key: String,
    /// Directory holding `<REGION>.geojson` fallback datasets.
    pub fallback_dir: Option<PathBuf>,
    /// Deadline for one region's fetch, retries included (default: 60)
    pub fetch_timeout_secs: u64,
    pub firms: FirmsConfig,
}

impl Default for FirewatchConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            snapshot_quota_bytes: None,
            snapshot_key: DEFAULT_SNAPSHOT_KEY.to_string(),
            fallback_dir: None,
            fetch_timeout_secs: 60,
            firms: FirmsConfig::default(),
        }
    }
}

impl FirewatchConfig {
    /// Load configuration from environment variables, starting from the defaults.
    ///
    /// Optional variables:
    /// - `FIREWATCH_SNAPSHOT_DIR` -- snapshot slot directory
    /// - `FIREWATCH_SNAPSHOT_QUOTA_BYTES` -- byte quota for the snapshot slot
    /// - `FIREWATCH_FIRMS_MAP_KEY` -- FIRMS map key
    /// - `FIREWATCH_FIRMS_BASE_URL` -- FIRMS country CSV endpoint
    /// - `FIREWATCH_FIRMS_PRODUCT` -- FIRMS product (default `MODIS_NRT`)
    /// - `FIREWATCH_FALLBACK_DIR` -- fallback GeoJSON directory
    /// - `FIREWATCH_FETCH_TIMEOUT_SECS` -- per-region fetch deadline (default 60)
    /// - `FIREWATCH_FETCH_MAX_RETRIES` -- feed retries (default 2)
    ///
    /// # Errors
    /// Returns `FirewatchError::Validation` when a numeric variable does not parse.
    pub fn from_env() -> Result<Self, FirewatchError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable lookup.
    ///
    /// # Errors
    /// Returns `FirewatchError::Validation` when a numeric variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, FirewatchError> {
        let var = |name: &str| {
            lookup(name).map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
        };
        let mut config = Self::default();

        if let Some(dir) = var("FIREWATCH_SNAPSHOT_DIR") {
            config.snapshot_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = var("FIREWATCH_SNAPSHOT_QUOTA_BYTES") {
            config.snapshot_quota_bytes =
                Some(parse_number("FIREWATCH_SNAPSHOT_QUOTA_BYTES", &raw)?);
        }
        if let Some(key) = var("FIREWATCH_FIRMS_MAP_KEY") {
            config.firms.map_key = Some(key);
        }
        if let Some(url) = var("FIREWATCH_FIRMS_BASE_URL") {
            config.firms.base_url = url;
        }
        if let Some(product) = var("FIREWATCH_FIRMS_PRODUCT") {
            config.firms.product = product;
        }
        if let Some(dir) = var("FIREWATCH_FALLBACK_DIR") {
            config.fallback_dir = Some(PathBuf::from(dir));
        }
        if let Some(raw) = var("FIREWATCH_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout_secs = parse_number("FIREWATCH_FETCH_TIMEOUT_SECS", &raw)?;
        }
        if let Some(raw) = var("FIREWATCH_FETCH_MAX_RETRIES") {
            config.firms.max_retries = parse_number("FIREWATCH_FETCH_MAX_RETRIES", &raw)?;
        }

        Ok(config)
    }

    /// Load configuration from a YAML file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not valid YAML.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    #[must_use]
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn parse_number<T>(name: &str, raw: &str) -> Result<T, FirewatchError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|err| FirewatchError::Validation(format!("invalid {name}: {err}")))
}
