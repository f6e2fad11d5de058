//! Persistence gateway.
//!
//! `TelemetryStore` is the unit-of-work boundary the HTTP layer talks to. Every
//! method acquires its own connection, applies its writes inside one
//! transaction, commits, and hands back materialized rows. Connections are
//! pooled and returned to the pool when the guard drops, on every exit path.

use crate::db::models::{NewReading, NewRecipe, NewSensor, Reading, Recipe, Sensor, SensorWithReadings};
use crate::db::bootstrap;
use crate::schema;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::PgConnection;
use log::info;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

pub type PgPool = Pool<ConnectionManager<PgConnection>>;
type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

// Postgres caps bind parameters per statement at 65535; a reading binds 4.
const MAX_READINGS_PER_INSERT: usize = 10_000;

/// Errors surfaced by the persistence gateway.
#[derive(Debug)]
pub enum StoreError {
    /// No connection could be acquired from the pool
    Pool(String),
    /// Query or commit failed
    Query(DieselError),
    /// A unique constraint rejected the write
    Conflict(String),
    /// A foreign key constraint rejected the write
    ForeignKey(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Pool(e) => write!(f, "connection pool error: {}", e),
            StoreError::Query(e) => write!(f, "query failed: {}", e),
            StoreError::Conflict(e) => write!(f, "unique constraint violated: {}", e),
            StoreError::ForeignKey(e) => write!(f, "foreign key constraint violated: {}", e),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Query(e) => Some(e),
            _ => None,
        }
    }
}

impl From<DieselError> for StoreError {
    fn from(value: DieselError) -> Self {
        match value {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, info) => {
                StoreError::ForeignKey(info.message().to_string())
            }
            other => StoreError::Query(other),
        }
    }
}

/// Offset/limit window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub skip: i64,
    pub limit: i64,
}

pub trait TelemetryStore: Send + Sync {
    /// Insert a sensor and return it with its generated id and (empty) readings.
    fn create_sensor(&self, sensor: NewSensor) -> Result<SensorWithReadings, StoreError>;

    /// Sensors in ascending id order, each with its readings ordered by timestamp.
    fn list_sensors(&self, page: Page) -> Result<Vec<SensorWithReadings>, StoreError>;

    /// Persist the whole batch in a single transaction. Either every row is
    /// committed and the row count is returned, or nothing is written.
    fn insert_readings(&self, rows: &[NewReading]) -> Result<usize, StoreError>;

    fn create_recipe(&self, recipe: NewRecipe) -> Result<Recipe, StoreError>;

    fn list_recipes(&self, page: Page) -> Result<Vec<Recipe>, StoreError>;
}

/// PostgreSQL-backed store over an r2d2 connection pool.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn connect(database_url: &str, max_size: u32) -> Result<Self, String> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .build(manager)
            .map_err(|e| format!("DB connection failed: {}", e))?;
        info!("Connected to database (pool max_size={})", max_size);
        Ok(PgStore { pool })
    }

    /// Create missing tables. Runs once at startup, before serving.
    pub fn bootstrap(&self) -> Result<(), String> {
        let mut conn = self.conn().map_err(|e| e.to_string())?;
        bootstrap::ensure_schema(&mut conn)
    }

    fn conn(&self) -> Result<PgPooledConnection, StoreError> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }
}

impl TelemetryStore for PgStore {
    fn create_sensor(&self, sensor: NewSensor) -> Result<SensorWithReadings, StoreError> {
        use schema::sensors::dsl as S;

        let mut conn = self.conn()?;
        let sensor = conn.transaction::<_, DieselError, _>(|conn| {
            diesel::insert_into(S::sensors)
                .values(&sensor)
                .returning(Sensor::as_returning())
                .get_result(conn)
        })?;
        Ok(SensorWithReadings {
            sensor,
            readings: Vec::new(),
        })
    }

    fn list_sensors(&self, page: Page) -> Result<Vec<SensorWithReadings>, StoreError> {
        use schema::readings::dsl as R;
        use schema::sensors::dsl as S;

        let mut conn = self.conn()?;
        // Both reads see the same snapshot so a sensor's reading list cannot
        // pick up rows committed between the two queries.
        let (sensors, readings) = conn
            .build_transaction()
            .read_only()
            .repeatable_read()
            .run::<_, DieselError, _>(|conn| {
                let sensors = S::sensors
                    .order(S::id.asc())
                    .offset(page.skip)
                    .limit(page.limit)
                    .select(Sensor::as_select())
                    .load(conn)?;
                let readings = Reading::belonging_to(&sensors)
                    .order((R::timestamp.asc(), R::id.asc()))
                    .select(Reading::as_select())
                    .load(conn)?;
                Ok((sensors, readings))
            })?;

        let grouped = readings.grouped_by(&sensors);
        Ok(sensors
            .into_iter()
            .zip(grouped)
            .map(|(sensor, readings)| SensorWithReadings { sensor, readings })
            .collect())
    }

    fn insert_readings(&self, rows: &[NewReading]) -> Result<usize, StoreError> {
        if rows.is_empty() {
            return Ok(0);
        }

        use schema::readings::dsl as R;

        let mut conn = self.conn()?;
        let inserted = conn.transaction::<_, DieselError, _>(|conn| {
            let mut inserted = 0;
            for chunk in rows.chunks(MAX_READINGS_PER_INSERT) {
                inserted += diesel::insert_into(R::readings).values(chunk).execute(conn)?;
            }
            Ok(inserted)
        })?;
        Ok(inserted)
    }

    fn create_recipe(&self, recipe: NewRecipe) -> Result<Recipe, StoreError> {
        use schema::recipes::dsl as RC;

        let mut conn = self.conn()?;
        let recipe = conn.transaction::<_, DieselError, _>(|conn| {
            diesel::insert_into(RC::recipes)
                .values(&recipe)
                .returning(Recipe::as_returning())
                .get_result(conn)
        })?;
        Ok(recipe)
    }

    fn list_recipes(&self, page: Page) -> Result<Vec<Recipe>, StoreError> {
        use schema::recipes::dsl as RC;

        let mut conn = self.conn()?;
        let recipes = RC::recipes
            .order(RC::id.asc())
            .offset(page.skip)
            .limit(page.limit)
            .select(Recipe::as_select())
            .load(&mut conn)?;
        Ok(recipes)
    }
}
