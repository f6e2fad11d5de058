use crate::api::error::ApiError;
use crate::api::schemas::ReadingCreate;
use crate::db::models::NewReading;
use crate::db::store::{StoreError, TelemetryStore};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};

pub const API_KEY_HEADER: &str = "x-api-key";

/// How `/ingest` callers are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestAuth {
    /// No secret configured: every caller is accepted.
    Open,
    /// Callers must send this exact value in `X-Api-Key`.
    SharedSecret(String),
}

impl IngestAuth {
    pub fn from_secret(secret: Option<&str>) -> Self {
        match secret {
            Some(s) if !s.is_empty() => IngestAuth::SharedSecret(s.to_string()),
            _ => IngestAuth::Open,
        }
    }

    pub fn authorize(&self, presented: Option<&str>) -> Result<(), ApiError> {
        match self {
            IngestAuth::Open => Ok(()),
            IngestAuth::SharedSecret(expected) if presented == Some(expected.as_str()) => Ok(()),
            IngestAuth::SharedSecret(_) => Err(ApiError::Unauthorized),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestAck {
    pub status: String,
    pub ingested: usize,
}

impl IngestAck {
    pub fn success(ingested: usize) -> Self {
        IngestAck {
            status: "success".to_string(),
            ingested,
        }
    }
}

/// Build insertable rows in request order. Readings sent without a timestamp
/// get `now()` at the moment each one is staged.
pub fn stage_readings<F>(readings: Vec<ReadingCreate>, mut now: F) -> Vec<NewReading>
where
    F: FnMut() -> DateTime<Utc>,
{
    readings
        .into_iter()
        .map(|r| NewReading {
            sensor_id: r.sensor_id,
            metric: r.metric,
            value: r.value,
            timestamp: r.timestamp.unwrap_or_else(&mut now),
        })
        .collect()
}

/// Stamp and persist a batch in one commit, returning how many rows were written.
pub fn ingest_readings(store: &dyn TelemetryStore, readings: Vec<ReadingCreate>) -> Result<usize, StoreError> {
    let rows = stage_readings(readings, Utc::now);
    let inserted = store.insert_readings(&rows)?;
    debug!("Ingest: committed {} reading(s)", inserted);
    Ok(inserted)
}
