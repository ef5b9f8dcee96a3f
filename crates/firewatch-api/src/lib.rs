use std::collections::BTreeMap;

use firewatch_core::{
    normalize_batch, BoundingBox, BoundingBoxStats, FeatureCollection, FirewatchError,
    ObservationRecord, RawRow, RegionCode, ReplaceSummary,
};
use firewatch_ingest::{
    CancellationToken, DirectoryFallback, FallbackError, FallbackSource, FirmsFeed,
    ObservationSink, ReconcileConfig, ReconcileReport, Reconciler, StaticFallback, StoredRegion,
};
use firewatch_store_sqlite::slot::{FileSlot, MemorySlot, SnapshotSlot};
use firewatch_store_sqlite::{codec, ObservationStore, ScalarQueryError};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OnceCell};

pub mod config;

pub use config::{FirewatchConfig, DEFAULT_SNAPSHOT_KEY};

pub const API_CONTRACT_VERSION: &str = "api.v1";

static FIREWATCH: OnceCell<Firewatch> = OnceCell::const_new();

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClearSummary {
    pub removed_rows: usize,
    pub persisted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStatus {
    pub api_contract_version: String,
    pub schema_version: i64,
    pub total_rows: usize,
    pub regions: BTreeMap<String, usize>,
    pub snapshot_key: String,
    pub snapshot_present: bool,
}

/// Fallback datasets selected by configuration.
#[derive(Debug, Clone)]
pub enum ConfiguredFallback {
    Directory(DirectoryFallback),
    Static(StaticFallback),
}

impl FallbackSource for ConfiguredFallback {
    async fn load(&self, region: &RegionCode) -> Result<FeatureCollection, FallbackError> {
        match self {
            Self::Directory(fallback) => fallback.load(region).await,
            Self::Static(fallback) => fallback.load(region).await,
        }
    }
}

impl From<StaticFallback> for ConfiguredFallback {
    fn from(value: StaticFallback) -> Self {
        Self::Static(value)
    }
}

impl From<DirectoryFallback> for ConfiguredFallback {
    fn from(value: DirectoryFallback) -> Self {
        Self::Directory(value)
    }
}

/// The observation cache with its snapshot slot and ingestion pipeline.
///
/// Every operation takes the store lock for its whole duration, so commits, reads
/// and snapshot writes never interleave.
pub struct Firewatch {
    store: Mutex<ObservationStore>,
    slot: Box<dyn SnapshotSlot>,
    snapshot_key: String,
    reconciler: Reconciler<FirmsFeed, ConfiguredFallback>,
}

impl Firewatch {
    /// Build an instance from configuration, hydrating from the snapshot slot.
    ///
    /// # Errors
    /// Returns `FirewatchError::Initialization` when the engine or the feed client
    /// cannot be created. A missing or unreadable snapshot is not an error.
    pub fn bootstrap(config: FirewatchConfig) -> Result<Self, FirewatchError> {
        let slot: Box<dyn SnapshotSlot> = match (&config.snapshot_dir, config.snapshot_quota_bytes)
        {
            (Some(dir), Some(quota)) => Box::new(FileSlot::new(dir).with_quota(quota)),
            (Some(dir), None) => Box::new(FileSlot::new(dir)),
            (None, Some(quota)) => Box::new(MemorySlot::with_quota(quota)),
            (None, None) => Box::new(MemorySlot::new()),
        };
        let fallback = match &config.fallback_dir {
            Some(dir) => ConfiguredFallback::Directory(DirectoryFallback::new(dir)),
            None => ConfiguredFallback::Static(StaticFallback::new()),
        };
        Self::bootstrap_with(config, slot, fallback)
    }

    /// Build an instance with an explicit slot and fallback datasets.
    ///
    /// # Errors
    /// Returns `FirewatchError::Initialization` when the engine or the feed client
    /// cannot be created.
    pub fn bootstrap_with(
        config: FirewatchConfig,
        slot: Box<dyn SnapshotSlot>,
        fallback: impl Into<ConfiguredFallback>,
    ) -> Result<Self, FirewatchError> {
        if !slot.is_durable() {
            tracing::warn!(
                key = %config.snapshot_key,
                "no snapshot directory configured, observations will be kept in memory only"
            );
        }
        let store = match hydrate(slot.as_ref(), &config.snapshot_key) {
            Some(store) => store,
            None => ObservationStore::open_in_memory().map_err(|err| {
                FirewatchError::Initialization(format!("failed to create observation store: {err:#}"))
            })?,
        };

        let feed = FirmsFeed::new(config.firms.clone()).map_err(|err| {
            FirewatchError::Initialization(format!("failed to build feed client: {err}"))
        })?;
        let reconciler = Reconciler::new(
            feed,
            fallback.into(),
            ReconcileConfig { fetch_timeout: config.fetch_timeout() },
        );

        Ok(Self { store: Mutex::new(store), slot, snapshot_key: config.snapshot_key, reconciler })
    }

    /// Validate `raw_rows` and replace every stored row of `region` with them.
    ///
    /// # Errors
    /// Returns `Validation` for a bad region code and `Store` when the transaction
    /// fails; the region then keeps its previous rows. Snapshot failures only clear
    /// `persisted`.
    pub async fn replace_region_observations(
        &self,
        region: &str,
        raw_rows: &[RawRow],
    ) -> Result<ReplaceSummary, FirewatchError> {
        let region = RegionCode::parse(region)?;
        let (records, dropped_rows) = normalize_batch(raw_rows);
        let accepted_rows = records.len();
        let stored = self.commit_region(&region, &records).await?;
        Ok(ReplaceSummary {
            region,
            accepted_rows,
            dropped_rows,
            stored_rows: stored.stored_rows,
            persisted: stored.persisted,
        })
    }

    /// One FeatureCollection per requested region, empty for regions without rows.
    ///
    /// # Errors
    /// Returns `Validation` for a bad region code or `Store` when the read fails.
    pub async fn read_regions_geojson<S: AsRef<str>>(
        &self,
        regions: &[S],
    ) -> Result<BTreeMap<String, FeatureCollection>, FirewatchError> {
        let regions = RegionCode::parse_all(regions)?;
        let store = self.store.lock().await;
        store.read_regions(&regions).map_err(store_error)
    }

    /// # Errors
    /// Returns `Validation` for a non-finite edge or `Store` when the query fails.
    pub async fn count_observations_in_bounding_box(
        &self,
        bbox: BoundingBox,
    ) -> Result<BoundingBoxStats, FirewatchError> {
        bbox.validate()?;
        let store = self.store.lock().await;
        store.count_in_box(&bbox).map_err(store_error)
    }

    /// Run a caller-supplied scalar query in the read-only sandbox.
    ///
    /// # Errors
    /// Returns `QueryValidation` when the query is rejected or fails in the engine, and
    /// `Store` when the read-only guard cannot be toggled.
    pub async fn run_observation_scalar_query(&self, sql: &str) -> Result<f64, FirewatchError> {
        let store = self.store.lock().await;
        store.run_scalar(sql).map_err(scalar_query_error)
    }

    /// Delete all rows and persist the emptied store.
    ///
    /// # Errors
    /// Returns `Store` when the delete fails.
    pub async fn clear_observations(&self) -> Result<ClearSummary, FirewatchError> {
        let mut store = self.store.lock().await;
        let removed_rows = store.clear().map_err(store_error)?;
        let persisted = self.persist(&store);
        tracing::info!(removed_rows, persisted, "cleared observations");
        Ok(ClearSummary { removed_rows, persisted })
    }

    /// Refresh `regions` from the feed with a fresh cancellation token.
    ///
    /// # Errors
    /// Returns `Validation` for bad region codes or an out-of-range lookback.
    pub async fn reconcile<S: AsRef<str>>(
        &self,
        regions: &[S],
        lookback_days: u32,
    ) -> Result<ReconcileReport, FirewatchError> {
        self.reconcile_with_cancel(regions, lookback_days, &CancellationToken::new()).await
    }

    /// # Errors
    /// Returns `Validation` for bad region codes or an out-of-range lookback.
    pub async fn reconcile_with_cancel<S: AsRef<str>>(
        &self,
        regions: &[S],
        lookback_days: u32,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, FirewatchError> {
        let regions = RegionCode::parse_all(regions)?;
        self.reconciler.reconcile(self, &regions, lookback_days, cancel).await
    }

    /// # Errors
    /// Returns `Store` when the counts cannot be read.
    pub async fn status(&self) -> Result<StoreStatus, FirewatchError> {
        let store = self.store.lock().await;
        let snapshot_present = match self.slot.get(&self.snapshot_key) {
            Ok(value) => value.is_some(),
            Err(err) => {
                tracing::warn!(error = %err, "snapshot slot unreadable");
                false
            }
        };
        Ok(StoreStatus {
            api_contract_version: API_CONTRACT_VERSION.to_string(),
            schema_version: store.schema_version().map_err(store_error)?,
            total_rows: store.row_count().map_err(store_error)?,
            regions: store.region_counts().map_err(store_error)?,
            snapshot_key: self.snapshot_key.clone(),
            snapshot_present,
        })
    }

    async fn commit_region(
        &self,
        region: &RegionCode,
        records: &[ObservationRecord],
    ) -> Result<StoredRegion, FirewatchError> {
        let mut store = self.store.lock().await;
        let stored_rows = store.replace_region(region, records).map_err(store_error)?;
        let persisted = self.persist(&store);
        Ok(StoredRegion { stored_rows, persisted })
    }

    /// Write the current image to the slot. Failures are logged, never raised.
    ///
    /// Returns `true` only when the image reached a durable slot.
    fn persist(&self, store: &ObservationStore) -> bool {
        match self.write_snapshot(store) {
            Ok(()) => self.slot.is_durable(),
            Err(err) => {
                tracing::warn!(error = %err, key = %self.snapshot_key, "snapshot not persisted");
                false
            }
        }
    }

    fn write_snapshot(&self, store: &ObservationStore) -> Result<(), FirewatchError> {
        let encoded = codec::encode_snapshot(store)
            .map_err(|err| FirewatchError::Persistence(format!("{err:#}")))?;
        self.slot
            .set(&self.snapshot_key, &encoded)
            .map_err(|err| FirewatchError::Persistence(err.to_string()))
    }
}

impl ObservationSink for Firewatch {
    async fn replace_region(
        &self,
        region: &RegionCode,
        records: Vec<ObservationRecord>,
    ) -> Result<StoredRegion, FirewatchError> {
        self.commit_region(region, &records).await
    }
}

/// Load the store from the slot. Any bad snapshot is removed and `None` returned.
fn hydrate(slot: &dyn SnapshotSlot, key: &str) -> Option<ObservationStore> {
    let encoded = match slot.get(key) {
        Ok(Some(encoded)) => encoded,
        Ok(None) => {
            tracing::info!(key, "no snapshot found, starting with an empty store");
            return None;
        }
        Err(err) => {
            tracing::warn!(key, error = %err, "snapshot slot unreadable, starting fresh");
            discard_snapshot(slot, key);
            return None;
        }
    };

    match codec::decode_snapshot(&encoded) {
        Ok(store) => {
            let rows = store.row_count().unwrap_or_default();
            tracing::info!(key, rows, "restored observation store from snapshot");
            Some(store)
        }
        Err(err) => {
            tracing::warn!(key, error = %format!("{err:#}"), "snapshot is corrupt, starting fresh");
            discard_snapshot(slot, key);
            None
        }
    }
}

fn discard_snapshot(slot: &dyn SnapshotSlot, key: &str) {
    if let Err(err) = slot.remove(key) {
        tracing::warn!(key, error = %err, "failed to remove bad snapshot");
    }
}

fn scalar_query_error(err: ScalarQueryError) -> FirewatchError {
    match err {
        ScalarQueryError::Rejected(message) => FirewatchError::QueryValidation(message),
        ScalarQueryError::Engine(err) => {
            FirewatchError::QueryValidation(format!("query failed: {err}"))
        }
        ScalarQueryError::Guard(err) => {
            tracing::error!(error = %err, "scalar query guard failed");
            FirewatchError::Store(format!("read-only guard failed: {err}"))
        }
    }
}

#[allow(clippy::needless_pass_by_value)]
fn store_error(err: anyhow::Error) -> FirewatchError {
    FirewatchError::Store(format!("{err:#}"))
}

/// Process-wide instance, bootstrapped from the environment on first use.
///
/// Concurrent first callers share one initialization. A failed initialization leaves
/// the cell empty so a later call retries.
///
/// # Errors
/// Returns the configuration or initialization error of the bootstrap attempt.
pub async fn get_store() -> Result<&'static Firewatch, FirewatchError> {
    FIREWATCH
        .get_or_try_init(|| async {
            let config = FirewatchConfig::from_env()?;
            Firewatch::bootstrap(config)
        })
        .await
}

/// [`Firewatch::replace_region_observations`] on the process-wide instance.
///
/// # Errors
/// See [`get_store`] and [`Firewatch::replace_region_observations`].
pub async fn replace_region_observations(
    region: &str,
    raw_rows: &[RawRow],
) -> Result<ReplaceSummary, FirewatchError> {
    get_store().await?.replace_region_observations(region, raw_rows).await
}

/// # Errors
/// See [`get_store`] and [`Firewatch::read_regions_geojson`].
pub async fn read_regions_geojson(
    regions: &[&str],
) -> Result<BTreeMap<String, FeatureCollection>, FirewatchError> {
    get_store().await?.read_regions_geojson(regions).await
}

/// # Errors
/// See [`get_store`] and [`Firewatch::count_observations_in_bounding_box`].
pub async fn count_observations_in_bounding_box(
    bbox: BoundingBox,
) -> Result<BoundingBoxStats, FirewatchError> {
    get_store().await?.count_observations_in_bounding_box(bbox).await
}

/// # Errors
/// See [`get_store`] and [`Firewatch::run_observation_scalar_query`].
pub async fn run_observation_scalar_query(sql: &str) -> Result<f64, FirewatchError> {
    get_store().await?.run_observation_scalar_query(sql).await
}

/// # Errors
/// See [`get_store`] and [`Firewatch::clear_observations`].
pub async fn clear_observations() -> Result<(), FirewatchError> {
    get_store().await?.clear_observations().await.map(|_| ())
}

/// # Errors
/// See [`get_store`] and [`Firewatch::reconcile`].
pub async fn reconcile(
    regions: &[&str],
    lookback_days: u32,
) -> Result<ReconcileReport, FirewatchError> {
    get_store().await?.reconcile(regions, lookback_days).await
}

/// # Errors
/// See [`get_store`] and [`Firewatch::status`].
pub async fn status() -> Result<StoreStatus, FirewatchError> {
    get_store().await?.status().await
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use anyhow::{anyhow, Result};
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRow {
        match value {
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn detection(latitude: f64, longitude: f64, brightness: f64) -> RawRow {
        raw(json!({
            "latitude": latitude.to_string(),
            "longitude": longitude.to_string(),
            "brightness": brightness.to_string(),
            "scan": "1.0",
            "track": "1.0",
            "acq_date": "2025-01-08",
            "acq_time": "0412",
            "satellite": "Aqua",
            "confidence": "80",
            "frp": "12.5",
            "daynight": "N"
        }))
    }

    fn memory_instance(slot: MemorySlot) -> Result<Firewatch> {
        Ok(Firewatch::bootstrap_with(
            FirewatchConfig::default(),
            Box::new(slot),
            StaticFallback::new(),
        )?)
    }

    fn unique_snapshot_dir() -> PathBuf {
        std::env::temp_dir().join(format!("firewatch-api-{}", ulid::Ulid::new()))
    }

    fn file_config(dir: &std::path::Path) -> FirewatchConfig {
        FirewatchConfig { snapshot_dir: Some(dir.to_path_buf()), ..FirewatchConfig::default() }
    }

    #[tokio::test]
    async fn fresh_instance_starts_empty() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        let status = firewatch.status().await?;
        assert_eq!(status.total_rows, 0);
        assert!(status.regions.is_empty());
        assert_eq!(status.snapshot_key, DEFAULT_SNAPSHOT_KEY);
        assert!(!status.snapshot_present);
        Ok(())
    }

    #[tokio::test]
    async fn bounding_box_scenario_for_bra() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        let summary = firewatch
            .replace_region_observations(
                "BRA",
                &[
                    detection(-10.0, -50.0, 300.0),
                    detection(-15.0, -45.0, 310.0),
                    detection(-20.0, -55.0, 320.0),
                    raw(json!({"latitude": "", "longitude": "-50"})),
                ],
            )
            .await?;
        assert_eq!((summary.accepted_rows, summary.dropped_rows, summary.stored_rows), (3, 1, 3));

        let stats = firewatch
            .count_observations_in_bounding_box(BoundingBox {
                north: 0.0,
                south: -30.0,
                east: -40.0,
                west: -60.0,
            })
            .await?;
        assert_eq!(stats.count, 3);
        assert_eq!(stats.brightness.avg, Some(310.0));
        Ok(())
    }

    #[tokio::test]
    async fn replacing_one_region_leaves_others_untouched() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        firewatch.replace_region_observations("USA", &[detection(40.0, -120.0, 330.0)]).await?;
        let before = firewatch.read_regions_geojson(&["USA"]).await?;

        firewatch.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;
        firewatch.replace_region_observations("BRA", &[detection(-11.0, -51.0, 301.0)]).await?;

        assert_eq!(firewatch.read_regions_geojson(&["USA"]).await?, before);
        let exported = firewatch.read_regions_geojson(&["BRA", "ARG"]).await?;
        assert_eq!(exported.get("BRA").map(FeatureCollection::len), Some(1));
        assert_eq!(exported.get("ARG").map(FeatureCollection::len), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn invalid_inputs_are_validation_errors() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        let result = firewatch.replace_region_observations("BRA;--", &[]).await;
        assert!(matches!(result, Err(FirewatchError::Validation(_))));

        let result = firewatch.read_regions_geojson(&["USA", ""]).await;
        assert!(matches!(result, Err(FirewatchError::Validation(_))));

        let bbox = BoundingBox { north: f64::INFINITY, south: 0.0, east: 1.0, west: 0.0 };
        let result = firewatch.count_observations_in_bounding_box(bbox).await;
        assert!(matches!(result, Err(FirewatchError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn rejected_scalar_query_leaves_data_unchanged() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        firewatch.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;
        let before = firewatch.read_regions_geojson(&["BRA"]).await?;

        let result = firewatch.run_observation_scalar_query("DELETE FROM observations").await;
        assert!(matches!(result, Err(FirewatchError::QueryValidation(_))));
        let result =
            firewatch.run_observation_scalar_query("SELECT 1; DROP TABLE observations").await;
        assert!(matches!(result, Err(FirewatchError::QueryValidation(_))));

        assert_eq!(firewatch.read_regions_geojson(&["BRA"]).await?, before);
        let count =
            firewatch.run_observation_scalar_query("SELECT COUNT(*) FROM observations").await?;
        assert_eq!(count, 1.0);
        Ok(())
    }

    #[test]
    fn guard_failures_are_store_errors_not_caller_errors() {
        let guard = scalar_query_error(ScalarQueryError::Guard(rusqlite_error()));
        assert!(matches!(guard, FirewatchError::Store(_)));
        assert!(!guard.is_caller_error());

        let engine = scalar_query_error(ScalarQueryError::Engine(rusqlite_error()));
        assert!(matches!(engine, FirewatchError::QueryValidation(_)));
        let rejected = scalar_query_error(ScalarQueryError::Rejected("no".to_string()));
        assert!(rejected.is_caller_error());
    }

    fn rusqlite_error() -> rusqlite::Error {
        rusqlite::Error::InvalidQuery
    }

    #[tokio::test]
    async fn snapshot_restores_rows_and_ids_in_a_new_instance() -> Result<()> {
        let dir = unique_snapshot_dir();
        let first = Firewatch::bootstrap(file_config(&dir))?;
        first
            .replace_region_observations(
                "BRA",
                &[detection(-10.0, -50.0, 300.0), detection(-15.0, -45.0, 310.0)],
            )
            .await?;
        first.replace_region_observations("USA", &[detection(40.0, -120.0, 330.0)]).await?;
        let before = first.read_regions_geojson(&["BRA", "USA"]).await?;

        let second = Firewatch::bootstrap(file_config(&dir))?;
        assert_eq!(second.read_regions_geojson(&["BRA", "USA"]).await?, before);
        assert!(second.status().await?.snapshot_present);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_removed_and_store_starts_empty() -> Result<()> {
        let dir = unique_snapshot_dir();
        let slot = FileSlot::new(&dir);
        slot.set(DEFAULT_SNAPSHOT_KEY, r#"{"format": "firewatch-snapshot.v1", "image": "@@"}"#)?;

        let firewatch = Firewatch::bootstrap(file_config(&dir))?;
        assert_eq!(firewatch.status().await?.total_rows, 0);
        assert_eq!(slot.get(DEFAULT_SNAPSHOT_KEY)?, None);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn failed_snapshot_write_keeps_the_commit() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::with_quota(16))?;
        let summary =
            firewatch.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;
        assert!(!summary.persisted);
        assert_eq!(summary.stored_rows, 1);

        let exported = firewatch.read_regions_geojson(&["BRA"]).await?;
        assert_eq!(exported.get("BRA").map(FeatureCollection::len), Some(1));
        Ok(())
    }

    #[tokio::test]
    async fn default_config_keeps_observations_in_memory_only() -> Result<()> {
        let first = Firewatch::bootstrap(FirewatchConfig::default())?;
        let summary =
            first.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;
        assert_eq!(summary.stored_rows, 1);
        assert!(!summary.persisted);
        assert!(!first.clear_observations().await?.persisted);

        let restarted = Firewatch::bootstrap(FirewatchConfig::default())?;
        assert_eq!(restarted.status().await?.total_rows, 0);
        Ok(())
    }

    #[tokio::test]
    async fn snapshot_directory_reports_persisted_commits() -> Result<()> {
        let dir = unique_snapshot_dir();
        let firewatch = Firewatch::bootstrap(file_config(&dir))?;
        let summary =
            firewatch.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;
        assert!(summary.persisted);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn clear_persists_the_emptied_store() -> Result<()> {
        let dir = unique_snapshot_dir();
        let first = Firewatch::bootstrap(file_config(&dir))?;
        first.replace_region_observations("USA", &[detection(40.0, -120.0, 330.0)]).await?;
        first.replace_region_observations("BRA", &[detection(-10.0, -50.0, 300.0)]).await?;

        let cleared = first.clear_observations().await?;
        assert_eq!(cleared, ClearSummary { removed_rows: 2, persisted: true });

        let second = Firewatch::bootstrap(file_config(&dir))?;
        assert_eq!(second.status().await?.total_rows, 0);

        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_falls_back_without_a_map_key() -> Result<()> {
        let dataset = FeatureCollection::parse(
            &json!({
                "type": "FeatureCollection",
                "features": [{
                    "type": "Feature",
                    "geometry": {"type": "Point", "coordinates": [-64.0, -34.0]},
                    "properties": {"brightness": 305.0, "acq_date": "2025-01-01",
                                   "acq_time": "0100", "satellite": "Terra"}
                }]
            })
            .to_string(),
        )?;
        let region_arg = RegionCode::parse("ARG")?;
        let firewatch = Firewatch::bootstrap_with(
            FirewatchConfig::default(),
            Box::new(MemorySlot::new()),
            StaticFallback::new().with_region(&region_arg, dataset),
        )?;
        firewatch.replace_region_observations("USA", &[detection(40.0, -120.0, 330.0)]).await?;

        let report = firewatch.reconcile(&["ARG", "USA"], 4).await?;
        let arg = report.region("ARG").ok_or_else(|| anyhow!("ARG missing"))?;
        assert!(matches!(arg.outcome, firewatch_ingest::RegionOutcome::FellBack { .. }));
        assert_eq!(arg.stored_rows, 1);
        let region_usa = RegionCode::parse("USA")?;
        assert_eq!(report.failed_regions(), vec![&region_usa]);

        let status = firewatch.status().await?;
        assert_eq!(status.regions.get("ARG"), Some(&1));
        assert_eq!(status.regions.get("USA"), Some(&1));
        Ok(())
    }

    #[tokio::test]
    async fn reconcile_rejects_out_of_range_lookback() -> Result<()> {
        let firewatch = memory_instance(MemorySlot::new())?;
        let result = firewatch.reconcile(&["USA"], 0).await;
        assert!(matches!(result, Err(FirewatchError::Validation(_))));
        Ok(())
    }

    #[tokio::test]
    async fn process_wide_instance_is_memoized() -> Result<()> {
        let (first, second) = tokio::join!(get_store(), get_store());
        assert!(std::ptr::eq(first?, second?));
        Ok(())
    }
}
