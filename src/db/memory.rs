//! In-process store backing the HTTP tests. Mirrors the PostgreSQL constraints
//! that matter to callers (serial ids, FK on readings, unique recipe names)
//! and can be told to fail the next commit.

use crate::db::models::{NewReading, NewRecipe, NewSensor, Reading, Recipe, Sensor, SensorWithReadings};
use crate::db::store::{Page, StoreError, TelemetryStore};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Tables {
    sensors: Vec<Sensor>,
    readings: Vec<Reading>,
    recipes: Vec<Recipe>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_next_commit: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write fail as if the commit was rejected by the database.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn readings(&self) -> Vec<Reading> {
        self.lock().readings.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_commit(&self) -> Result<(), StoreError> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Query(diesel::result::Error::BrokenTransactionManager));
        }
        Ok(())
    }
}

fn window<T: Clone>(rows: &[T], page: Page) -> Vec<T> {
    rows.iter()
        .skip(page.skip.max(0) as usize)
        .take(page.limit.max(0) as usize)
        .cloned()
        .collect()
}

fn next_id(len: usize) -> i32 {
    len as i32 + 1
}

impl TelemetryStore for MemoryStore {
    fn create_sensor(&self, sensor: NewSensor) -> Result<SensorWithReadings, StoreError> {
        self.check_commit()?;
        let mut tables = self.lock();
        let row = Sensor {
            id: next_id(tables.sensors.len()),
            name: sensor.name,
            metric: sensor.metric,
            unit: sensor.unit,
            location: sensor.location,
        };
        tables.sensors.push(row.clone());
        Ok(SensorWithReadings {
            sensor: row,
            readings: Vec::new(),
        })
    }

    fn list_sensors(&self, page: Page) -> Result<Vec<SensorWithReadings>, StoreError> {
        let tables = self.lock();
        Ok(window(&tables.sensors, page)
            .into_iter()
            .map(|sensor| {
                let mut readings: Vec<Reading> = tables
                    .readings
                    .iter()
                    .filter(|r| r.sensor_id == sensor.id)
                    .cloned()
                    .collect();
                readings.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
                SensorWithReadings { sensor, readings }
            })
            .collect())
    }

    fn insert_readings(&self, rows: &[NewReading]) -> Result<usize, StoreError> {
        self.check_commit()?;
        let mut tables = self.lock();
        if let Some(orphan) = rows
            .iter()
            .find(|r| !tables.sensors.iter().any(|s| s.id == r.sensor_id))
        {
            return Err(StoreError::ForeignKey(format!(
                "sensor {} does not exist",
                orphan.sensor_id
            )));
        }
        for row in rows {
            let id = next_id(tables.readings.len());
            tables.readings.push(Reading {
                id,
                sensor_id: row.sensor_id,
                metric: row.metric.clone(),
                value: row.value,
                timestamp: row.timestamp,
            });
        }
        Ok(rows.len())
    }

    fn create_recipe(&self, recipe: NewRecipe) -> Result<Recipe, StoreError> {
        self.check_commit()?;
        let mut tables = self.lock();
        if tables.recipes.iter().any(|r| r.name == recipe.name) {
            return Err(StoreError::Conflict(format!(
                "recipe name {:?} already exists",
                recipe.name
            )));
        }
        let now = Utc::now();
        let row = Recipe {
            id: next_id(tables.recipes.len()),
            name: recipe.name,
            description: recipe.description,
            created_at: now,
            updated_at: now,
        };
        tables.recipes.push(row.clone());
        Ok(row)
    }

    fn list_recipes(&self, page: Page) -> Result<Vec<Recipe>, StoreError> {
        Ok(window(&self.lock().recipes, page))
    }
}
