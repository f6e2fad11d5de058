//! Request and response shapes.
//!
//! Create shapes are what clients send; view shapes are what they get back.
//! Conversions between views and database rows are explicit `from_row` /
//! `into_new` functions.

use crate::api::error::{FieldIssue, ValidationError};
use crate::db::models::{NewRecipe, NewSensor, Reading, Recipe, SensorWithReadings};
use crate::db::store::Page;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SensorCreate {
    pub name: String,
    pub metric: String,
    pub unit: String,
    #[serde(default)]
    pub location: Option<String>,
}

impl SensorCreate {
    pub fn into_new(self) -> Result<NewSensor, ValidationError> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "body.name", &self.name);
        require_non_empty(&mut issues, "body.metric", &self.metric);
        require_non_empty(&mut issues, "body.unit", &self.unit);
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }
        Ok(NewSensor {
            name: self.name,
            metric: self.metric,
            unit: self.unit,
            location: self.location,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ReadingCreate {
    pub sensor_id: i32,
    pub metric: String,
    pub value: f64,
    /// `None` means the client did not send one; the ingest path stamps it.
    #[serde(default, deserialize_with = "crate::utils::deserialize_optional_timestamp")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Ingest body: a bare reading object or an array of them.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingBatch {
    One(ReadingCreate),
    Many(Vec<ReadingCreate>),
}

impl ReadingBatch {
    /// Decide the shape by looking at the JSON value itself rather than by
    /// trial deserialization, so errors keep their field paths.
    pub fn from_json(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Array(items) => {
                if items.is_empty() {
                    return Err(ValidationError::single("body", "at least one reading is required"));
                }
                let mut readings = Vec::with_capacity(items.len());
                let mut issues = Vec::new();
                for (index, item) in items.into_iter().enumerate() {
                    match decode::<ReadingCreate>(item, &format!("body.{}", index)) {
                        Ok(r) => readings.push(r),
                        Err(e) => issues.extend(e.issues),
                    }
                }
                if issues.is_empty() {
                    Ok(ReadingBatch::Many(readings))
                } else {
                    Err(ValidationError { issues })
                }
            }
            object @ Value::Object(_) => decode(object, "body").map(ReadingBatch::One),
            _ => Err(ValidationError::single(
                "body",
                "expected a reading object or an array of readings",
            )),
        }
    }

    pub fn into_vec(self) -> Vec<ReadingCreate> {
        match self {
            ReadingBatch::One(reading) => vec![reading],
            ReadingBatch::Many(readings) => readings,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RecipeCreate {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl RecipeCreate {
    pub fn into_new(self) -> Result<NewRecipe, ValidationError> {
        let mut issues = Vec::new();
        require_non_empty(&mut issues, "body.name", &self.name);
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }
        Ok(NewRecipe {
            name: self.name,
            description: self.description,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingView {
    pub id: i32,
    pub sensor_id: i32,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl ReadingView {
    pub fn from_row(row: Reading) -> Self {
        ReadingView {
            id: row.id,
            sensor_id: row.sensor_id,
            metric: row.metric,
            value: row.value,
            timestamp: row.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorView {
    pub id: i32,
    pub name: String,
    pub metric: String,
    pub unit: String,
    pub location: Option<String>,
    pub readings: Vec<ReadingView>,
}

impl SensorView {
    pub fn from_row(row: SensorWithReadings) -> Self {
        let SensorWithReadings { sensor, readings } = row;
        SensorView {
            id: sensor.id,
            name: sensor.name,
            metric: sensor.metric,
            unit: sensor.unit,
            location: sensor.location,
            readings: readings.into_iter().map(ReadingView::from_row).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipeView {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecipeView {
    pub fn from_row(row: Recipe) -> Self {
        RecipeView {
            id: row.id,
            name: row.name,
            description: row.description,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_LIMIT
}

impl Default for PageParams {
    fn default() -> Self {
        PageParams {
            skip: 0,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

impl PageParams {
    pub fn page(self) -> Page {
        Page {
            skip: i64::from(self.skip),
            limit: i64::from(self.limit),
        }
    }
}

/// Parse a request body as JSON without interpreting its shape yet.
pub fn parse_body(body: &[u8]) -> Result<Value, ValidationError> {
    serde_json::from_slice(body).map_err(|e| ValidationError::single("body", format!("invalid JSON: {}", e)))
}

/// Deserialize `value` into `T`, reporting the failing field under `loc`.
pub fn decode<T: DeserializeOwned>(value: Value, loc: &str) -> Result<T, ValidationError> {
    serde_path_to_error::deserialize(value).map_err(|e| {
        let path = e.path().to_string();
        let loc = if path == "." {
            loc.to_string()
        } else {
            format!("{}.{}", loc, path)
        };
        ValidationError {
            issues: vec![FieldIssue::new(loc, e.inner().to_string())],
        }
    })
}

fn require_non_empty(issues: &mut Vec<FieldIssue>, loc: &str, value: &str) {
    if value.trim().is_empty() {
        issues.push(FieldIssue::new(loc, "must not be empty"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Sensor;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn single_object_and_one_element_array_normalize_identically() {
        let reading = json!({"sensor_id": 1, "metric": "ph", "value": 7.1});
        let one = ReadingBatch::from_json(reading.clone()).unwrap().into_vec();
        let many = ReadingBatch::from_json(json!([reading])).unwrap().into_vec();
        assert_eq!(one, many);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].timestamp, None);
    }

    #[test]
    fn batch_keeps_order_and_explicit_timestamps() {
        let batch = ReadingBatch::from_json(json!([
            {"sensor_id": 2, "metric": "temperature", "value": 21.5, "timestamp": "2024-05-01T08:00:00Z"},
            {"sensor_id": 1, "metric": "ph", "value": 6, "timestamp": null},
        ]))
        .unwrap()
        .into_vec();

        assert_eq!(batch.iter().map(|r| r.sensor_id).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(
            batch[0].timestamp,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap())
        );
        assert_eq!(batch[1].value, 6.0);
        assert_eq!(batch[1].timestamp, None);
    }

    #[test]
    fn reports_field_paths_for_bad_items() {
        let err = ReadingBatch::from_json(json!([
            {"sensor_id": 1, "metric": "ph", "value": 7.0},
            {"sensor_id": 1, "metric": "ph", "value": "high"},
            {"metric": "ph", "value": 7.0},
        ]))
        .unwrap_err();

        assert_eq!(err.issues.len(), 2);
        assert_eq!(err.issues[0].loc, "body.1.value");
        assert_eq!(err.issues[1].loc, "body.2");
        assert!(err.issues[1].msg.contains("sensor_id"));
    }

    #[test]
    fn rejects_empty_and_scalar_bodies() {
        assert!(ReadingBatch::from_json(json!([])).is_err());
        assert!(ReadingBatch::from_json(json!(42)).is_err());
        assert!(ReadingBatch::from_json(json!("reading")).is_err());
        assert!(parse_body(b"{not json").is_err());
    }

    #[test]
    fn sensor_create_requires_non_empty_strings() {
        let sensor: SensorCreate = decode(json!({"name": " ", "metric": "ph", "unit": ""}), "body").unwrap();
        let err = sensor.into_new().unwrap_err();
        let locs = err.issues.iter().map(|i| i.loc.as_str()).collect::<Vec<_>>();
        assert_eq!(locs, vec!["body.name", "body.unit"]);

        let missing = decode::<SensorCreate>(json!({"name": "tank-1", "metric": "ph"}), "body").unwrap_err();
        assert!(missing.issues[0].msg.contains("unit"));
    }

    #[test]
    fn sensor_view_embeds_readings() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let row = SensorWithReadings {
            sensor: Sensor {
                id: 3,
                name: "tank-1".into(),
                metric: "temperature".into(),
                unit: "C".into(),
                location: None,
            },
            readings: vec![Reading {
                id: 10,
                sensor_id: 3,
                metric: "temperature".into(),
                value: 22.0,
                timestamp: ts,
            }],
        };
        let view = SensorView::from_row(row);
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["location"], Value::Null);
        assert_eq!(json["readings"][0]["id"], 10);
        assert_eq!(view.readings[0].timestamp, ts);
    }
}
