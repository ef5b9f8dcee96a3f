//! Remote CSV feed of fire detections (NASA FIRMS country endpoint).

use std::future::Future;
use std::time::Duration;

use firewatch_core::RegionCode;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FIRMS_BASE_URL: &str = "https://firms.modaps.eosdis.nasa.gov/api/country/csv";
pub const DEFAULT_FIRMS_PRODUCT: &str = "MODIS_NRT";

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("no FIRMS map key configured")]
    MissingMapKey,
    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("feed returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("request timeout")]
    Timeout,
}

/// Source of raw CSV text for one region and lookback window.
pub trait FeedSource: Send + Sync {
    fn fetch_csv(
        &self,
        region: &RegionCode,
        lookback_days: u32,
    ) -> impl Future<Output = Result<String, FeedError>> + Send;
}

/// FIRMS request configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FirmsConfig {
    pub base_url: String,
    /// Map key issued by FIRMS. Fetches fail without one.
    pub map_key: Option<String>,
    pub product: String,
    /// Per-request timeout in seconds (default: 30)
    pub timeout_secs: u64,
    /// Retries for 5xx and connection errors (default: 2)
    pub max_retries: u32,
    /// Base retry delay in milliseconds, multiplied by the attempt number (default: 1000)
    pub retry_delay_ms: u64,
}

impl Default for FirmsConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_FIRMS_BASE_URL.to_string(),
            map_key: None,
            product: DEFAULT_FIRMS_PRODUCT.to_string(),
            timeout_secs: 30,
            max_retries: 2,
            retry_delay_ms: 1000,
        }
    }
}

pub struct FirmsFeed {
    client: Client,
    config: FirmsConfig,
}

impl FirmsFeed {
    /// # Errors
    /// Returns `FeedError::Request` when the HTTP client cannot be built.
    pub fn new(config: FirmsConfig) -> Result<Self, FeedError> {
        let client = Client::builder().timeout(Duration::from_secs(config.timeout_secs)).build()?;
        Ok(Self { client, config })
    }

    #[must_use]
    pub fn config(&self) -> &FirmsConfig {
        &self.config
    }

    fn country_url(&self, map_key: &str, region: &RegionCode, lookback_days: u32) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            map_key,
            self.config.product,
            region,
            lookback_days
        )
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.retry_delay_ms.saturating_mul(u64::from(attempt) + 1))
    }
}

impl FeedSource for FirmsFeed {
    async fn fetch_csv(&self, region: &RegionCode, lookback_days: u32) -> Result<String, FeedError> {
        let map_key = self
            .config
            .map_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or(FeedError::MissingMapKey)?;
        let url = self.country_url(map_key, region, lookback_days);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match self.client.get(&url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.text().await?);
                    }

                    if status.is_server_error() {
                        last_error =
                            Some(FeedError::Status { status: status.as_u16(), body: String::new() });
                        if attempt < self.config.max_retries {
                            tracing::debug!(region = %region, attempt, status = status.as_u16(), "retrying feed request");
                            tokio::time::sleep(self.retry_delay(attempt)).await;
                            continue;
                        }
                    }

                    let body = response.text().await.unwrap_or_default();
                    return Err(FeedError::Status {
                        status: status.as_u16(),
                        body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
                    });
                }
                Err(err) => {
                    if err.is_timeout() {
                        last_error = Some(FeedError::Timeout);
                    } else if err.is_connect() || err.is_request() {
                        last_error = Some(FeedError::Request(err));
                    } else {
                        return Err(FeedError::Request(err));
                    }

                    if attempt < self.config.max_retries {
                        tracing::debug!(region = %region, attempt, "retrying feed request");
                        tokio::time::sleep(self.retry_delay(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(FeedError::Timeout))
    }
}
