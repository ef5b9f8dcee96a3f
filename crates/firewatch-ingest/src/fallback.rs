//! Static GeoJSON datasets used when the live feed is unavailable.

use std::collections::BTreeMap;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use firewatch_core::geojson::GeoJsonError;
use firewatch_core::{FeatureCollection, RegionCode};

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("no fallback dataset for region {0}")]
    Missing(String),
    #[error("failed to read fallback dataset for region {region}: {source}")]
    Io {
        region: String,
        #[source]
        source: std::io::Error,
    },
    #[error("fallback dataset for region {region} is invalid: {source}")]
    Invalid {
        region: String,
        #[source]
        source: GeoJsonError,
    },
}

pub trait FallbackSource: Send + Sync {
    fn load(
        &self,
        region: &RegionCode,
    ) -> impl Future<Output = Result<FeatureCollection, FallbackError>> + Send;
}

/// Reads `<dir>/<REGION>.geojson`.
#[derive(Debug, Clone)]
pub struct DirectoryFallback {
    dir: PathBuf,
}

impl DirectoryFallback {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn path_for(&self, region: &RegionCode) -> PathBuf {
        self.dir.join(format!("{region}.geojson"))
    }
}

impl FallbackSource for DirectoryFallback {
    async fn load(&self, region: &RegionCode) -> Result<FeatureCollection, FallbackError> {
        let text = match tokio::fs::read_to_string(self.path_for(region)).await {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(FallbackError::Missing(region.to_string()));
            }
            Err(source) => return Err(FallbackError::Io { region: region.to_string(), source }),
        };
        FeatureCollection::parse(&text)
            .map_err(|source| FallbackError::Invalid { region: region.to_string(), source })
    }
}

/// In-memory datasets keyed by region code.
#[derive(Debug, Clone, Default)]
pub struct StaticFallback {
    datasets: BTreeMap<String, FeatureCollection>,
}

impl StaticFallback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_region(mut self, region: &RegionCode, collection: FeatureCollection) -> Self {
        self.datasets.insert(region.as_str().to_string(), collection);
        self
    }
}

impl FallbackSource for StaticFallback {
    async fn load(&self, region: &RegionCode) -> Result<FeatureCollection, FallbackError> {
        self.datasets
            .get(region.as_str())
            .cloned()
            .ok_or_else(|| FallbackError::Missing(region.to_string()))
    }
}
