use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use firewatch_api::{ClearSummary, Firewatch, FirewatchConfig, StoreStatus, API_CONTRACT_VERSION};
use firewatch_core::{
    BoundingBox, BoundingBoxStats, FeatureCollection, FirewatchError, RawRow, ReplaceSummary,
};
use firewatch_ingest::{ReconcileReport, DEFAULT_LOOKBACK_DAYS, DEFAULT_REGIONS};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");

#[derive(Clone)]
struct ServiceState {
    firewatch: Arc<Firewatch>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    error: ErrorBody,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Deserialize)]
struct ReplaceRequest {
    region: String,
    #[serde(default)]
    rows: Vec<RawRow>,
}

#[derive(Debug, Clone, Deserialize)]
struct GeoJsonRequest {
    regions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ScalarRequest {
    sql: String,
}

#[derive(Debug, Clone, Serialize)]
struct ScalarResponse {
    value: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ReconcileRequest {
    #[serde(default = "default_regions")]
    regions: Vec<String>,
    #[serde(default = "default_lookback_days")]
    lookback_days: u32,
}

fn default_regions() -> Vec<String> {
    DEFAULT_REGIONS.iter().map(ToString::to_string).collect()
}

fn default_lookback_days() -> u32 {
    DEFAULT_LOOKBACK_DAYS
}

#[derive(Debug, Parser)]
#[command(name = "firewatch-service")]
#[command(about = "Local HTTP service for the Firewatch observation cache")]
struct Args {
    /// YAML configuration file; environment variables are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl From<FirewatchError> for ServiceError {
    fn from(err: FirewatchError) -> Self {
        let status = if err.is_caller_error() {
            StatusCode::BAD_REQUEST
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        ServiceError {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ErrorBody { kind: err.kind(), message: err.to_string() },
        }
    }
}

fn envelope<T>(data: T) -> Json<ServiceEnvelope<T>>
where
    T: Serialize,
{
    Json(ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    })
}

type Envelope<T> = Result<Json<ServiceEnvelope<T>>, ServiceError>;

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/status", get(status))
        .route("/v1/observations/replace", post(observations_replace))
        .route("/v1/observations/geojson", post(observations_geojson))
        .route("/v1/observations/bbox-stats", post(observations_bbox_stats))
        .route("/v1/observations/scalar", post(observations_scalar))
        .route("/v1/observations/clear", post(observations_clear))
        .route("/v1/ingest/reconcile", post(ingest_reconcile))
        .with_state(state)
}

fn load_config(path: Option<&PathBuf>) -> Result<FirewatchConfig> {
    match path {
        Some(path) => FirewatchConfig::from_yaml_file(path),
        None => FirewatchConfig::from_env().context("invalid environment configuration"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    let firewatch = Firewatch::bootstrap(config).context("failed to bootstrap observation store")?;
    let state = ServiceState { firewatch: Arc::new(firewatch) };

    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "firewatch service listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    envelope(HealthResponse { status: "ok" })
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn status(State(state): State<ServiceState>) -> Envelope<StoreStatus> {
    Ok(envelope(state.firewatch.status().await?))
}

async fn observations_replace(
    State(state): State<ServiceState>,
    Json(request): Json<ReplaceRequest>,
) -> Envelope<ReplaceSummary> {
    let summary =
        state.firewatch.replace_region_observations(&request.region, &request.rows).await?;
    Ok(envelope(summary))
}

async fn observations_geojson(
    State(state): State<ServiceState>,
    Json(request): Json<GeoJsonRequest>,
) -> Envelope<BTreeMap<String, FeatureCollection>> {
    Ok(envelope(state.firewatch.read_regions_geojson(&request.regions).await?))
}

async fn observations_bbox_stats(
    State(state): State<ServiceState>,
    Json(bbox): Json<BoundingBox>,
) -> Envelope<BoundingBoxStats> {
    Ok(envelope(state.firewatch.count_observations_in_bounding_box(bbox).await?))
}

async fn observations_scalar(
    State(state): State<ServiceState>,
    Json(request): Json<ScalarRequest>,
) -> Envelope<ScalarResponse> {
    let value = state.firewatch.run_observation_scalar_query(&request.sql).await?;
    Ok(envelope(ScalarResponse { value }))
}

async fn observations_clear(State(state): State<ServiceState>) -> Envelope<ClearSummary> {
    Ok(envelope(state.firewatch.clear_observations().await?))
}

async fn ingest_reconcile(
    State(state): State<ServiceState>,
    Json(request): Json<ReconcileRequest>,
) -> Envelope<ReconcileReport> {
    let report = state.firewatch.reconcile(&request.regions, request.lookback_days).await?;
    Ok(envelope(report))
}
