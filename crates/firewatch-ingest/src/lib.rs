//! Region-by-region reconciliation of the live feed into the observation store.
//!
//! Each region is fetched, parsed, validated and committed on its own: a failure in
//! one region never changes the outcome of another.

use std::future::Future;
use std::time::Duration;

use firewatch_core::{csv, normalize_batch, FirewatchError, ObservationRecord, RawRow, RegionCode};
use futures::future::join_all;
use serde::{Deserialize, Serialize};

pub mod cancel;
pub mod fallback;
pub mod feed;

pub use cancel::CancellationToken;
pub use fallback::{DirectoryFallback, FallbackError, FallbackSource, StaticFallback};
pub use feed::{FeedError, FeedSource, FirmsConfig, FirmsFeed};

pub const MIN_LOOKBACK_DAYS: u32 = 1;
pub const MAX_LOOKBACK_DAYS: u32 = 10;
pub const DEFAULT_LOOKBACK_DAYS: u32 = 4;

/// Regions refreshed when a caller names none.
pub const DEFAULT_REGIONS: &[&str] = &["USA", "ARG", "BRA"];

/// Header columns a feed body must carry to be treated as detection data.
pub const REQUIRED_FEED_COLUMNS: &[&str] = &["latitude", "longitude"];

/// Result of committing one region's batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRegion {
    pub stored_rows: usize,
    pub persisted: bool,
}

/// Destination of validated batches. Each call is one whole-region replace.
pub trait ObservationSink: Send + Sync {
    fn replace_region(
        &self,
        region: &RegionCode,
        records: Vec<ObservationRecord>,
    ) -> impl Future<Output = Result<StoredRegion, FirewatchError>> + Send;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileConfig {
    /// Deadline for one region's fetch, retries included.
    pub fetch_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self { fetch_timeout: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegionOutcome {
    Fetched,
    FellBack { reason: String },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionReport {
    pub region: RegionCode,
    #[serde(flatten)]
    pub outcome: RegionOutcome,
    pub accepted_rows: usize,
    pub dropped_rows: usize,
    pub stored_rows: usize,
    pub persisted: bool,
}

impl RegionReport {
    fn failed(region: &RegionCode, reason: String) -> Self {
        Self {
            region: region.clone(),
            outcome: RegionOutcome::Failed { reason },
            accepted_rows: 0,
            dropped_rows: 0,
            stored_rows: 0,
            persisted: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub lookback_days: u32,
    pub regions: Vec<RegionReport>,
}

impl ReconcileReport {
    #[must_use]
    pub fn region(&self, code: &str) -> Option<&RegionReport> {
        self.regions.iter().find(|report| report.region.as_str() == code)
    }

    #[must_use]
    pub fn failed_regions(&self) -> Vec<&RegionCode> {
        self.regions
            .iter()
            .filter(|report| matches!(report.outcome, RegionOutcome::Failed { .. }))
            .map(|report| &report.region)
            .collect()
    }
}

/// # Errors
/// Returns `FirewatchError::Validation` outside `1..=10` days.
pub fn validate_lookback_days(lookback_days: u32) -> Result<(), FirewatchError> {
    if (MIN_LOOKBACK_DAYS..=MAX_LOOKBACK_DAYS).contains(&lookback_days) {
        Ok(())
    } else {
        Err(FirewatchError::Validation(format!(
            "lookback_days must be between {MIN_LOOKBACK_DAYS} and {MAX_LOOKBACK_DAYS}, got {lookback_days}"
        )))
    }
}

pub struct Reconciler<F, B> {
    feed: F,
    fallback: B,
    config: ReconcileConfig,
}

impl<F: FeedSource, B: FallbackSource> Reconciler<F, B> {
    #[must_use]
    pub fn new(feed: F, fallback: B, config: ReconcileConfig) -> Self {
        Self { feed, fallback, config }
    }

    /// Refresh every region from the feed, falling back to static datasets per region.
    ///
    /// Regions run concurrently on the calling task; the returned report lists them in
    /// request order.
    ///
    /// # Errors
    /// Returns `FirewatchError::Validation` when `lookback_days` is out of range. Region
    /// failures are reported in the [`ReconcileReport`], never as an error.
    pub async fn reconcile<S: ObservationSink>(
        &self,
        sink: &S,
        regions: &[RegionCode],
        lookback_days: u32,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, FirewatchError> {
        validate_lookback_days(lookback_days)?;

        let reports = join_all(
            regions.iter().map(|region| self.reconcile_region(sink, region, lookback_days, cancel)),
        )
        .await;

        let failed = reports
            .iter()
            .filter(|report| matches!(report.outcome, RegionOutcome::Failed { .. }))
            .count();
        tracing::info!(regions = reports.len(), failed, lookback_days, "reconcile finished");
        Ok(ReconcileReport { lookback_days, regions: reports })
    }

    async fn reconcile_region<S: ObservationSink>(
        &self,
        sink: &S,
        region: &RegionCode,
        lookback_days: u32,
        cancel: &CancellationToken,
    ) -> RegionReport {
        let fetch_error = match self.fetch_rows(region, lookback_days, cancel).await {
            Ok(rows) => return commit(sink, region, &rows, RegionOutcome::Fetched).await,
            Err(err) => err,
        };

        tracing::warn!(region = %region, error = %fetch_error, "feed unavailable, loading fallback dataset");
        match self.fallback.load(region).await {
            Ok(collection) => {
                let rows: Vec<RawRow> =
                    collection.features.iter().map(firewatch_core::Feature::to_raw_row).collect();
                let outcome = RegionOutcome::FellBack { reason: fetch_error.to_string() };
                commit(sink, region, &rows, outcome).await
            }
            Err(err) => {
                tracing::error!(region = %region, error = %err, "fallback dataset unavailable, region left unchanged");
                RegionReport::failed(region, format!("{fetch_error}; fallback: {err}"))
            }
        }
    }

    async fn fetch_rows(
        &self,
        region: &RegionCode,
        lookback_days: u32,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawRow>, FirewatchError> {
        if cancel.is_cancelled() {
            return Err(FirewatchError::Fetch("fetch cancelled".to_string()));
        }

        let fetch = tokio::time::timeout(
            self.config.fetch_timeout,
            self.feed.fetch_csv(region, lookback_days),
        );
        let text = tokio::select! {
            () = cancel.cancelled() => {
                return Err(FirewatchError::Fetch("fetch cancelled".to_string()));
            }
            result = fetch => match result {
                Ok(Ok(text)) => text,
                Ok(Err(err)) => return Err(FirewatchError::Fetch(err.to_string())),
                Err(_) => {
                    return Err(FirewatchError::Fetch(format!(
                        "fetch timed out after {} ms",
                        self.config.fetch_timeout.as_millis()
                    )));
                }
            },
        };

        csv::parse_rows(&text, REQUIRED_FEED_COLUMNS)
            .map_err(|err| FirewatchError::Parse(err.to_string()))
    }
}

async fn commit<S: ObservationSink>(
    sink: &S,
    region: &RegionCode,
    rows: &[RawRow],
    outcome: RegionOutcome,
) -> RegionReport {
    let (records, dropped_rows) = normalize_batch(rows);
    let accepted_rows = records.len();
    match sink.replace_region(region, records).await {
        Ok(stored) => {
            tracing::info!(
                region = %region,
                accepted_rows,
                dropped_rows,
                stored_rows = stored.stored_rows,
                persisted = stored.persisted,
                "region reconciled"
            );
            RegionReport {
                region: region.clone(),
                outcome,
                accepted_rows,
                dropped_rows,
                stored_rows: stored.stored_rows,
                persisted: stored.persisted,
            }
        }
        Err(err) => {
            tracing::error!(region = %region, error = %err, "region replace failed");
            RegionReport::failed(region, err.to_string())
        }
    }
}
