//! Diesel model structs for sensors, their readings, and recipes.
//!
//! Row structs (`Sensor`, `Reading`, `Recipe`) are what the store hands back;
//! `New*` structs are what it inserts. Mapping to the JSON representations
//! lives in `crate::api::schemas`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::schema;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::sensors)]
pub struct Sensor {
    pub id: i32,
    pub name: String,
    pub metric: String,
    pub unit: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::sensors)]
pub struct NewSensor {
    pub name: String,
    pub metric: String,
    pub unit: String,
    pub location: Option<String>,
}

// A reading only references its sensor; it does not share the sensor's lifecycle.
#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Associations, Selectable)]
#[diesel(table_name = schema::readings)]
#[diesel(belongs_to(Sensor))]
pub struct Reading {
    pub id: i32,
    pub sensor_id: i32,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Insertable)]
#[diesel(table_name = schema::readings)]
pub struct NewReading {
    pub sensor_id: i32,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Selectable)]
#[diesel(table_name = schema::recipes)]
pub struct Recipe {
    pub id: i32,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Set once on insert; nothing updates recipes.
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = schema::recipes)]
pub struct NewRecipe {
    pub name: String,
    pub description: Option<String>,
}

/// A sensor together with the readings that reference it.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorWithReadings {
    pub sensor: Sensor,
    pub readings: Vec<Reading>,
}
