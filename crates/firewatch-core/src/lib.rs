use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod csv;
pub mod geojson;

pub use geojson::{Feature, FeatureCollection, Geometry};

/// Untyped input row, as produced by the CSV reader or by GeoJSON feature properties.
pub type RawRow = BTreeMap<String, Value>;

const MAX_REGION_CODE_LEN: usize = 32;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum FirewatchError {
    #[error("initialization error: {0}")]
    Initialization(String),
    #[error("fetch error: {0}")]
    Fetch(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("query validation error: {0}")]
    QueryValidation(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("store error: {0}")]
    Store(String),
}

impl FirewatchError {
    /// Stable machine-readable kind, used by the HTTP surface.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Initialization(_) => "initialization",
            Self::Fetch(_) => "fetch",
            Self::Parse(_) => "parse",
            Self::Persistence(_) => "persistence",
            Self::QueryValidation(_) => "query_validation",
            Self::Validation(_) => "validation",
            Self::Store(_) => "store",
        }
    }

    /// Whether the failure was caused by caller input rather than the system.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(self, Self::QueryValidation(_) | Self::Validation(_))
    }
}

/// Identifier partitioning the observation table, e.g. `USA` or `BRA`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct RegionCode(String);

impl RegionCode {
    /// Validate a region code against the allow-list `[A-Za-z0-9_-]{1,32}`.
    ///
    /// # Errors
    /// Returns `FirewatchError::Validation` when the trimmed input is empty, too long,
    /// or contains characters outside the allow-list.
    pub fn parse(raw: &str) -> Result<Self, FirewatchError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(FirewatchError::Validation("region code must not be empty".to_string()));
        }
        if trimmed.len() > MAX_REGION_CODE_LEN {
            return Err(FirewatchError::Validation(format!(
                "region code exceeds {MAX_REGION_CODE_LEN} characters"
            )));
        }
        if !trimmed.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(FirewatchError::Validation(format!(
                "region code contains unsupported characters: {trimmed}"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Parse a list of region codes, failing on the first invalid entry.
    ///
    /// # Errors
    /// Returns the validation error of the first rejected code.
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Self>, FirewatchError> {
        raw.iter().map(|code| Self::parse(code.as_ref())).collect()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RegionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RegionCode {
    type Error = FirewatchError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<RegionCode> for String {
    fn from(value: RegionCode) -> Self {
        value.0
    }
}

/// One satellite fire detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObservationRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub brightness: f64,
    pub scan: Option<f64>,
    pub track: Option<f64>,
    pub acq_date: String,
    pub acq_time: String,
    pub satellite: String,
    pub confidence: Option<i32>,
    pub version: Option<String>,
    pub bright_t31: Option<f64>,
    pub frp: Option<f64>,
    pub daynight: Option<String>,
}

/// Reason a raw row was refused by [`normalize_observation`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RowRejection {
    MissingLatitude,
    MissingLongitude,
    MissingBrightness,
    MissingAcqDate,
    MissingAcqTime,
    MissingSatellite,
}

impl RowRejection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingLatitude => "missing_latitude",
            Self::MissingLongitude => "missing_longitude",
            Self::MissingBrightness => "missing_brightness",
            Self::MissingAcqDate => "missing_acq_date",
            Self::MissingAcqTime => "missing_acq_time",
            Self::MissingSatellite => "missing_satellite",
        }
    }
}

/// Turn an untyped row into a typed record, or reject it.
///
/// A row is accepted only with finite `latitude`, `longitude` and `brightness` and
/// non-blank `acq_date`, `acq_time` and `satellite`. Optional numeric fields that are
/// absent, blank, or not finite become `None`.
///
/// # Errors
/// Returns the first [`RowRejection`] that applies.
pub fn normalize_observation(raw: &RawRow) -> Result<ObservationRecord, RowRejection> {
    let latitude = number_field(raw, "latitude").ok_or(RowRejection::MissingLatitude)?;
    let longitude = number_field(raw, "longitude").ok_or(RowRejection::MissingLongitude)?;
    let brightness = number_field(raw, "brightness").ok_or(RowRejection::MissingBrightness)?;
    let acq_date = text_field(raw, "acq_date").ok_or(RowRejection::MissingAcqDate)?;
    let acq_time = text_field(raw, "acq_time").ok_or(RowRejection::MissingAcqTime)?;
    let satellite = text_field(raw, "satellite").ok_or(RowRejection::MissingSatellite)?;

    Ok(ObservationRecord {
        latitude,
        longitude,
        brightness,
        scan: number_field(raw, "scan"),
        track: number_field(raw, "track"),
        acq_date,
        acq_time,
        satellite,
        confidence: integer_field(raw, "confidence"),
        version: text_field(raw, "version"),
        bright_t31: number_field(raw, "bright_t31"),
        frp: number_field(raw, "frp"),
        daynight: text_field(raw, "daynight"),
    })
}

/// Normalize a batch, keeping accepted records in input order.
///
/// Returns the accepted records and the number of dropped rows.
#[must_use]
pub fn normalize_batch(rows: &[RawRow]) -> (Vec<ObservationRecord>, usize) {
    let mut accepted = Vec::with_capacity(rows.len());
    let mut dropped = 0_usize;
    for row in rows {
        match normalize_observation(row) {
            Ok(record) => accepted.push(record),
            Err(_) => dropped += 1,
        }
    }
    (accepted, dropped)
}

fn number_field(raw: &RawRow, key: &str) -> Option<f64> {
    let parsed = match raw.get(key)? {
        Value::Number(number) => number.as_f64()?,
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            text.parse::<f64>().ok()?
        }
        _ => return None,
    };
    parsed.is_finite().then_some(parsed)
}

fn integer_field(raw: &RawRow, key: &str) -> Option<i32> {
    let value = number_field(raw, key)?;
    if value.fract() != 0.0 || value < f64::from(i32::MIN) || value > f64::from(i32::MAX) {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let integral = value as i32;
    Some(integral)
}

fn text_field(raw: &RawRow, key: &str) -> Option<String> {
    match raw.get(key)? {
        Value::String(text) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

/// Latitude/longitude rectangle. `west > east` means the box wraps the antimeridian.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub north: f64,
    pub south: f64,
    pub east: f64,
    pub west: f64,
}

impl BoundingBox {
    /// # Errors
    /// Returns `FirewatchError::Validation` when any edge is NaN or infinite.
    pub fn validate(&self) -> Result<(), FirewatchError> {
        let edges =
            [("north", self.north), ("south", self.south), ("east", self.east), ("west", self.west)];
        for (name, value) in edges {
            if !value.is_finite() {
                return Err(FirewatchError::Validation(format!(
                    "bounding box edge `{name}` must be a finite number"
                )));
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn wraps_antimeridian(&self) -> bool {
        self.west > self.east
    }

    /// `(min, max)` latitude regardless of how north/south were supplied.
    #[must_use]
    pub fn latitude_range(&self) -> (f64, f64) {
        (self.north.min(self.south), self.north.max(self.south))
    }

    #[must_use]
    pub fn contains(&self, latitude: f64, longitude: f64) -> bool {
        let (lat_min, lat_max) = self.latitude_range();
        if latitude < lat_min || latitude > lat_max {
            return false;
        }
        if self.wraps_antimeridian() {
            longitude >= self.west || longitude <= self.east
        } else {
            longitude >= self.west && longitude <= self.east
        }
    }

    /// Human-readable summary of the box, one line per component.
    #[must_use]
    pub fn describe(&self, label: Option<&str>) -> String {
        let mut parts = Vec::with_capacity(3);
        if let Some(label) = label.map(str::trim).filter(|label| !label.is_empty()) {
            parts.push(format!("Region: {label}"));
        }
        let (lat_min, lat_max) = self.latitude_range();
        parts.push(format!("Latitude: {lat_min:.2}° to {lat_max:.2}°"));
        if self.wraps_antimeridian() {
            parts.push(format!(
                "Longitude: wraps dateline ({:.2}° → 180° and -180° → {:.2}°)",
                self.west, self.east
            ));
        } else {
            parts.push(format!("Longitude: {:.2}° to {:.2}°", self.west, self.east));
        }
        parts.join("\n")
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct FieldStats {
    pub avg: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BoundingBoxStats {
    pub count: u64,
    pub brightness: FieldStats,
    pub frp: FieldStats,
    pub scan: FieldStats,
    pub track: FieldStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub region: RegionCode,
    pub accepted_rows: usize,
    pub dropped_rows: usize,
    pub stored_rows: usize,
    pub persisted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use proptest::prelude::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawRow {
        match value {
            Value::Object(map) => map.into_iter().collect(),
            other => panic!("fixture must be an object, got {other}"),
        }
    }

    fn firms_row() -> RawRow {
        raw(json!({
            "latitude": "-12.5",
            "longitude": "-55.25",
            "brightness": "315.4",
            "scan": "1.1",
            "track": "",
            "acq_date": "2025-01-08",
            "acq_time": "0412",
            "satellite": "Aqua",
            "confidence": "78",
            "version": "6.1NRT",
            "bright_t31": "290.2",
            "frp": "12.8",
            "daynight": "N"
        }))
    }

    #[test]
    fn normalize_accepts_firms_csv_row() -> Result<()> {
        let record =
            normalize_observation(&firms_row()).map_err(|reason| anyhow!(reason.as_str()))?;
        assert_eq!(record.latitude, -12.5);
        assert_eq!(record.longitude, -55.25);
        assert_eq!(record.brightness, 315.4);
        assert_eq!(record.scan, Some(1.1));
        assert_eq!(record.track, None);
        assert_eq!(record.acq_time, "0412");
        assert_eq!(record.confidence, Some(78));
        assert_eq!(record.daynight.as_deref(), Some("N"));
        Ok(())
    }

    #[test]
    fn normalize_rejects_missing_required_fields() {
        let mut row = firms_row();
        row.insert("latitude".to_string(), json!("not-a-number"));
        assert_eq!(normalize_observation(&row), Err(RowRejection::MissingLatitude));

        let mut row = firms_row();
        row.insert("brightness".to_string(), json!("inf"));
        assert_eq!(normalize_observation(&row), Err(RowRejection::MissingBrightness));

        let mut row = firms_row();
        row.insert("satellite".to_string(), json!("   "));
        assert_eq!(normalize_observation(&row), Err(RowRejection::MissingSatellite));

        let mut row = firms_row();
        row.remove("acq_date");
        assert_eq!(normalize_observation(&row), Err(RowRejection::MissingAcqDate));
    }

    #[test]
    fn normalize_accepts_numeric_json_values() -> Result<()> {
        let row = raw(json!({
            "latitude": 10.0,
            "longitude": 20.5,
            "brightness": 330,
            "acq_date": "2025-01-08",
            "acq_time": 1830,
            "satellite": "Terra",
            "confidence": "h"
        }));
        let record = normalize_observation(&row).map_err(|reason| anyhow!(reason.as_str()))?;
        assert_eq!(record.acq_time, "1830");
        assert_eq!(record.brightness, 330.0);
        assert_eq!(record.confidence, None);
        Ok(())
    }

    #[test]
    fn normalize_batch_counts_dropped_rows() {
        let mut bad = firms_row();
        bad.remove("longitude");
        let (accepted, dropped) = normalize_batch(&[firms_row(), bad, firms_row()]);
        assert_eq!(accepted.len(), 2);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn region_code_allow_list() {
        assert!(RegionCode::parse(" BRA ").is_ok_and(|code| code.as_str() == "BRA"));
        assert!(RegionCode::parse("north_america-1").is_ok());
        assert!(RegionCode::parse("").is_err());
        assert!(RegionCode::parse("USA/../etc").is_err());
        assert!(RegionCode::parse("BRA'; DROP TABLE observations").is_err());
        assert!(RegionCode::parse(&"X".repeat(33)).is_err());
    }

    #[test]
    fn antimeridian_box_matches_both_sides() {
        let bbox = BoundingBox { north: 10.0, south: -10.0, east: -170.0, west: 170.0 };
        assert!(bbox.wraps_antimeridian());
        assert!(bbox.contains(0.0, 179.0));
        assert!(bbox.contains(0.0, -179.0));
        assert!(!bbox.contains(0.0, 0.0));
        assert!(!bbox.contains(11.0, 179.0));
    }

    #[test]
    fn bounding_box_rejects_non_finite_edges() {
        let bbox = BoundingBox { north: f64::NAN, south: 0.0, east: 1.0, west: 0.0 };
        assert!(matches!(bbox.validate(), Err(FirewatchError::Validation(_))));
    }

    #[test]
    fn describe_mentions_dateline_wrap() {
        let bbox = BoundingBox { north: -10.0, south: 10.0, east: -170.0, west: 170.0 };
        let text = bbox.describe(Some(" Fiji "));
        assert!(text.starts_with("Region: Fiji\n"));
        assert!(text.contains("Latitude: -10.00° to 10.00°"));
        assert!(text.contains("wraps dateline (170.00° → 180° and -180° → -170.00°)"));
    }

    proptest! {
        #[test]
        fn latitude_filter_is_order_independent(
            a in -90.0_f64..90.0,
            b in -90.0_f64..90.0,
            lat in -90.0_f64..90.0,
            lon in -180.0_f64..180.0,
        ) {
            let forward = BoundingBox { north: a, south: b, east: 180.0, west: -180.0 };
            let flipped = BoundingBox { north: b, south: a, east: 180.0, west: -180.0 };
            prop_assert_eq!(forward.contains(lat, lon), flipped.contains(lat, lon));
        }

        #[test]
        fn wrapped_box_is_complement_of_gap(
            west in 0.0_f64..180.0,
            east in -180.0_f64..0.0,
            lon in -180.0_f64..180.0,
        ) {
            prop_assume!(west > east);
            let bbox = BoundingBox { north: 90.0, south: -90.0, east, west };
            let in_gap = lon > east && lon < west;
            prop_assert_eq!(bbox.contains(0.0, lon), !in_gap);
        }
    }
}
