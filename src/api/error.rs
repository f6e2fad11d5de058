use crate::db::store::StoreError;
use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use log::error;
use serde::Serialize;
use serde_json::json;
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// One problem with a request, located by a dotted path such as `body.0.value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub loc: String,
    pub msg: String,
}

impl FieldIssue {
    pub fn new(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        FieldIssue {
            loc: loc.into(),
            msg: msg.into(),
        }
    }
}

/// Structural rejection of a request payload. Never reaches the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(loc: impl Into<String>, msg: impl Into<String>) -> Self {
        ValidationError {
            issues: vec![FieldIssue::new(loc, msg)],
        }
    }
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let parts = self
            .issues
            .iter()
            .map(|i| format!("{}: {}", i.loc, i.msg))
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "validation failed: {}", parts)
    }
}

impl Error for ValidationError {}

#[derive(Debug)]
pub enum ApiError {
    Validation(ValidationError),
    Unauthorized,
    Conflict(String),
    /// Storage fault; the message is logged, never returned to the client.
    Storage(String),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Validation(e) => write!(f, "{}", e),
            ApiError::Unauthorized => write!(f, "unauthorized"),
            ApiError::Conflict(e) => write!(f, "conflict: {}", e),
            ApiError::Storage(e) => write!(f, "storage error: {}", e),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Validation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(value: ValidationError) -> Self {
        ApiError::Validation(value)
    }
}

impl From<StoreError> for ApiError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            other => ApiError::Storage(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation(e) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(json!({ "detail": e.issues }))).into_response()
            }
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, Json(json!({ "detail": "Unauthorized" }))).into_response(),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, Json(json!({ "detail": msg }))).into_response(),
            ApiError::Storage(msg) => {
                error!("Request failed on storage: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "detail": "storage error" }))).into_response()
            }
        }
    }
}
