//! GeoJSON types used for map exports and for the static fallback datasets.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Map, Value};

use crate::{normalize_batch, ObservationRecord, RawRow};

const FEATURE_COLLECTION: &str = "FeatureCollection";
const FEATURE: &str = "Feature";
const POINT: &str = "Point";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum GeoJsonError {
    #[error("invalid GeoJSON document: {0}")]
    Json(String),
    #[error("expected a FeatureCollection, found `{0}`")]
    NotFeatureCollection(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeatureCollection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    #[must_use]
    pub fn new(features: Vec<Feature>) -> Self {
        Self { kind: FEATURE_COLLECTION.to_string(), features }
    }

    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Parse a GeoJSON document that must be a `FeatureCollection`.
    ///
    /// # Errors
    /// Returns `GeoJsonError` when the text is not JSON of the expected shape.
    pub fn parse(text: &str) -> Result<Self, GeoJsonError> {
        let collection: Self =
            serde_json::from_str(text).map_err(|err| GeoJsonError::Json(err.to_string()))?;
        if collection.kind != FEATURE_COLLECTION {
            return Err(GeoJsonError::NotFeatureCollection(collection.kind));
        }
        Ok(collection)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.features.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    /// Convert every feature back into an observation, dropping features that fail
    /// validation. Returns the accepted records and the dropped count.
    #[must_use]
    pub fn to_observations(&self) -> (Vec<ObservationRecord>, usize) {
        let rows: Vec<RawRow> = self.features.iter().map(Feature::to_raw_row).collect();
        normalize_batch(&rows)
    }
}

impl Default for FeatureCollection {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub properties: Map<String, Value>,
}

impl Feature {
    /// Export form of a stored observation: a Point at `[lon, lat]` plus its attributes.
    #[must_use]
    pub fn from_observation(id: i64, record: &ObservationRecord) -> Self {
        let properties = match json!({
            "id": id,
            "brightness": record.brightness,
            "scan": record.scan,
            "track": record.track,
            "acq_date": record.acq_date,
            "acq_time": record.acq_time,
            "satellite": record.satellite,
            "confidence": record.confidence,
            "version": record.version,
            "bright_t31": record.bright_t31,
            "frp": record.frp,
            "daynight": record.daynight,
        }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            kind: FEATURE.to_string(),
            geometry: Some(Geometry::point(record.longitude, record.latitude)),
            properties,
        }
    }

    /// Flatten the feature into an untyped row; Point coordinates take precedence over
    /// any `latitude`/`longitude` properties.
    #[must_use]
    pub fn to_raw_row(&self) -> RawRow {
        let mut row: RawRow =
            self.properties.iter().map(|(key, value)| (key.clone(), value.clone())).collect();
        if let Some((longitude, latitude)) = self.geometry.as_ref().and_then(Geometry::as_point) {
            row.insert("longitude".to_string(), json!(longitude));
            row.insert("latitude".to_string(), json!(latitude));
        }
        row
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Geometry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub coordinates: Value,
}

impl Geometry {
    #[must_use]
    pub fn point(longitude: f64, latitude: f64) -> Self {
        Self { kind: POINT.to_string(), coordinates: json!([longitude, latitude]) }
    }

    /// `(longitude, latitude)` when this is a Point with finite coordinates.
    #[must_use]
    pub fn as_point(&self) -> Option<(f64, f64)> {
        if self.kind != POINT {
            return None;
        }
        let coordinates = self.coordinates.as_array()?;
        let longitude = coordinates.first()?.as_f64()?;
        let latitude = coordinates.get(1)?.as_f64()?;
        (longitude.is_finite() && latitude.is_finite()).then_some((longitude, latitude))
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default())
}
