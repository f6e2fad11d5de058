use crate::api::error::{ApiError, ValidationError};
use crate::api::metrics::{self, MetricsRegistry};
use crate::api::schemas::{
    PageParams, ReadingBatch, RecipeCreate, RecipeView, SensorCreate, SensorView, decode, parse_body,
};
use crate::db::store::TelemetryStore;
use crate::services::ingest::{self, API_KEY_HEADER, IngestAck, IngestAuth};
use axum::body::Bytes;
use axum::extract::rejection::QueryRejection;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use log::warn;
use serde_json::{Value, json};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub auth: Arc<IngestAuth>,
}

impl AppState {
    pub fn new(store: Arc<dyn TelemetryStore>, auth: IngestAuth) -> Self {
        AppState {
            store,
            metrics: Arc::new(MetricsRegistry::new()),
            auth: Arc::new(auth),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_text))
        .route("/sensors", get(list_sensors).post(create_sensor))
        .route("/ingest", post(ingest_readings))
        .route("/recipes", get(list_recipes).post(create_recipe))
        .route_layer(middleware::from_fn_with_state(state.clone(), metrics::track_requests))
        .with_state(state)
}

/// Run blocking store work off the async executor.
async fn with_store<T, F>(state: &AppState, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&dyn TelemetryStore) -> Result<T, ApiError> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    tokio::task::spawn_blocking(move || work(store.as_ref()))
        .await
        .map_err(|e| ApiError::Storage(format!("store task failed: {}", e)))?
}

fn page_params(query: Result<Query<PageParams>, QueryRejection>) -> Result<PageParams, ApiError> {
    match query {
        Ok(Query(params)) => Ok(params),
        Err(rejection) => Err(ValidationError::single("query", rejection.body_text()).into()),
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, metrics::CONTENT_TYPE)], state.metrics.render())
}

async fn create_sensor(State(state): State<AppState>, body: Bytes) -> Result<Json<SensorView>, ApiError> {
    let sensor = decode::<SensorCreate>(parse_body(&body)?, "body")?.into_new()?;
    let created = with_store(&state, move |store| Ok(store.create_sensor(sensor)?)).await?;
    Ok(Json(SensorView::from_row(created)))
}

async fn list_sensors(
    State(state): State<AppState>,
    query: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Vec<SensorView>>, ApiError> {
    let page = page_params(query)?.page();
    let sensors = with_store(&state, move |store| Ok(store.list_sensors(page)?)).await?;
    Ok(Json(sensors.into_iter().map(SensorView::from_row).collect()))
}

async fn ingest_readings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestAck>, ApiError> {
    // Shape errors are reported before the key is looked at.
    let readings = ReadingBatch::from_json(parse_body(&body)?)?.into_vec();

    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    if let Err(e) = state.auth.authorize(presented) {
        warn!(
            "Ingest: rejected batch of {} reading(s), {} API key",
            readings.len(),
            if presented.is_some() { "wrong" } else { "missing" }
        );
        return Err(e);
    }

    let ingested = with_store(&state, move |store| Ok(ingest::ingest_readings(store, readings)?)).await?;
    state.metrics.add_readings_ingested(ingested);
    Ok(Json(IngestAck::success(ingested)))
}

async fn create_recipe(State(state): State<AppState>, body: Bytes) -> Result<Json<RecipeView>, ApiError> {
    let recipe = decode::<RecipeCreate>(parse_body(&body)?, "body")?.into_new()?;
    let created = with_store(&state, move |store| Ok(store.create_recipe(recipe)?)).await?;
    Ok(Json(RecipeView::from_row(created)))
}

async fn list_recipes(
    State(state): State<AppState>,
    query: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<Vec<RecipeView>>, ApiError> {
    let page = page_params(query)?.page();
    let recipes = with_store(&state, move |store| Ok(store.list_recipes(page)?)).await?;
    Ok(Json(recipes.into_iter().map(RecipeView::from_row).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{DateTime, Utc};
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        store: Arc<MemoryStore>,
        state: AppState,
    }

    fn app(auth: IngestAuth) -> TestApp {
        let store = Arc::new(MemoryStore::new());
        let state = AppState::new(store.clone(), auth);
        TestApp {
            router: build_router(state.clone()),
            store,
            state,
        }
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value, key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header("X-Api-Key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    async fn create_sensors(app: &TestApp, n: usize) {
        for i in 0..n {
            let body = json!({"name": format!("sensor-{}", i), "metric": "ph", "unit": "pH"});
            let (status, _) = send(app, post_json("/sensors", &body, None)).await;
            assert_eq!(status, StatusCode::OK);
        }
    }

    fn ids(body: &Value) -> Vec<i64> {
        body.as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let app = app(IngestAuth::Open);
        let (status, body) = send(&app, get_req("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn created_sensor_lists_with_same_fields_and_no_readings() {
        let app = app(IngestAuth::Open);
        let body = json!({"name": "sump", "metric": "temperature", "unit": "C", "location": "basement"});
        let (status, created) = send(&app, post_json("/sensors", &body, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["id"], 1);
        assert_eq!(created["readings"], json!([]));

        let (status, listed) = send(&app, get_req("/sensors")).await;
        assert_eq!(status, StatusCode::OK);
        let listed: Vec<SensorView> = serde_json::from_value(listed).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "sump");
        assert_eq!(listed[0].metric, "temperature");
        assert_eq!(listed[0].unit, "C");
        assert_eq!(listed[0].location.as_deref(), Some("basement"));
        assert!(listed[0].readings.is_empty());
    }

    #[tokio::test]
    async fn sensor_create_rejects_missing_fields() {
        let app = app(IngestAuth::Open);
        let (status, body) = send(&app, post_json("/sensors", &json!({"name": "x", "metric": "ph"}), None)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"][0]["msg"].as_str().unwrap().contains("unit"));
    }

    #[tokio::test]
    async fn sensor_listing_honours_skip_and_limit() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 5).await;

        let (_, all) = send(&app, get_req("/sensors")).await;
        assert_eq!(ids(&all), vec![1, 2, 3, 4, 5]);

        let (_, window) = send(&app, get_req("/sensors?skip=1&limit=2")).await;
        assert_eq!(ids(&window), vec![2, 3]);

        let (_, tail) = send(&app, get_req("/sensors?skip=3&limit=10")).await;
        assert_eq!(ids(&tail), vec![4, 5]);

        let (_, beyond) = send(&app, get_req("/sensors?skip=10")).await;
        assert_eq!(beyond, json!([]));

        let (_, none) = send(&app, get_req("/sensors?limit=0")).await;
        assert_eq!(none, json!([]));

        let (status, _) = send(&app, get_req("/sensors?skip=-1")).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn ingest_commits_whole_batch_or_nothing() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        let batch = json!([
            {"sensor_id": 1, "metric": "ph", "value": 7.0},
            {"sensor_id": 1, "metric": "ph", "value": 7.1},
            {"sensor_id": 1, "metric": "ph", "value": 7.2},
        ]);

        let (status, body) = send(&app, post_json("/ingest", &batch, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "success", "ingested": 3}));
        assert_eq!(app.store.readings().len(), 3);

        app.store.fail_next_commit();
        let (status, body) = send(&app, post_json("/ingest", &batch, None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.get("ingested").is_none());
        assert_eq!(app.store.readings().len(), 3);
    }

    #[tokio::test]
    async fn bare_object_and_single_element_array_store_the_same_row() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        let reading = json!({"sensor_id": 1, "metric": "ph", "value": 6.8, "timestamp": "2024-02-03T04:05:06Z"});

        let (_, one) = send(&app, post_json("/ingest", &reading, None)).await;
        let (_, many) = send(&app, post_json("/ingest", &json!([reading]), None)).await;
        assert_eq!(one["ingested"], 1);
        assert_eq!(many["ingested"], 1);

        let rows = app.store.readings();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            (rows[0].sensor_id, &rows[0].metric, rows[0].value, rows[0].timestamp),
            (rows[1].sensor_id, &rows[1].metric, rows[1].value, rows[1].timestamp)
        );
    }

    #[tokio::test]
    async fn ingest_stamps_missing_timestamps_and_keeps_explicit_ones() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        let explicit: DateTime<Utc> = "2022-12-31T23:59:59Z".parse().unwrap();
        let batch = json!([
            {"sensor_id": 1, "metric": "temperature", "value": 19.0},
            {"sensor_id": 1, "metric": "temperature", "value": 19.5, "timestamp": "2022-12-31T23:59:59Z"},
        ]);

        let before = Utc::now();
        let (status, _) = send(&app, post_json("/ingest", &batch, None)).await;
        let after = Utc::now();
        assert_eq!(status, StatusCode::OK);

        let rows = app.store.readings();
        assert!(before <= rows[0].timestamp && rows[0].timestamp <= after);
        assert_eq!(rows[1].timestamp, explicit);

        let (_, sensors) = send(&app, get_req("/sensors")).await;
        let sensors: Vec<SensorView> = serde_json::from_value(sensors).unwrap();
        assert_eq!(sensors[0].readings.len(), 2);
        assert_eq!(sensors[0].readings[0].timestamp, explicit);
    }

    #[tokio::test]
    async fn epoch_milliseconds_and_seconds_store_the_same_instant() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        let batch = json!([
            {"sensor_id": 1, "metric": "ph", "value": 7.0, "timestamp": 1_709_289_000_000_i64},
            {"sensor_id": 1, "metric": "ph", "value": 7.1, "timestamp": 1_709_289_000},
        ]);

        let (status, _) = send(&app, post_json("/ingest", &batch, None)).await;
        assert_eq!(status, StatusCode::OK);

        let expected: DateTime<Utc> = "2024-03-01T10:30:00Z".parse().unwrap();
        let rows = app.store.readings();
        assert_eq!(rows[0].timestamp, expected);
        assert_eq!(rows[1].timestamp, expected);
    }

    #[tokio::test]
    async fn shared_secret_gates_ingest() {
        let app = app(IngestAuth::SharedSecret("tank-key".into()));
        create_sensors(&app, 1).await;
        let reading = json!({"sensor_id": 1, "metric": "ph", "value": 7.0});

        let (status, body) = send(&app, post_json("/ingest", &reading, None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body, json!({"detail": "Unauthorized"}));

        let (status, _) = send(&app, post_json("/ingest", &reading, Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(app.store.readings().is_empty());

        let (status, _) = send(&app, post_json("/ingest", &reading, Some("tank-key"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.store.readings().len(), 1);
    }

    #[tokio::test]
    async fn open_mode_ignores_the_header() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        let reading = json!({"sensor_id": 1, "metric": "ph", "value": 7.0});

        let (status, _) = send(&app, post_json("/ingest", &reading, Some("anything"))).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, post_json("/ingest", &reading, None)).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_before_auth() {
        let app = app(IngestAuth::SharedSecret("tank-key".into()));
        let bad = json!([{"sensor_id": "one", "metric": "ph", "value": 7.0}]);

        let (status, body) = send(&app, post_json("/ingest", &bad, Some("wrong"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["detail"][0]["loc"], "body.0.sensor_id");

        let (status, _) = send(&app, post_json("/ingest", &json!([]), Some("tank-key"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn reading_for_unknown_sensor_is_a_server_error() {
        let app = app(IngestAuth::Open);
        let (status, _) = send(&app, post_json("/ingest", &json!({"sensor_id": 42, "metric": "ph", "value": 7.0}), None)).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(app.store.readings().is_empty());
    }

    #[tokio::test]
    async fn recipes_have_unique_names() {
        let app = app(IngestAuth::Open);
        let recipe = json!({"name": "lettuce", "description": "NFT channel, pH 6.0"});

        let (status, created) = send(&app, post_json("/recipes", &recipe, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(created["created_at"], created["updated_at"]);

        let (status, _) = send(&app, post_json("/recipes", &recipe, None)).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, listed) = send(&app, get_req("/recipes")).await;
        let listed: Vec<RecipeView> = serde_json::from_value(listed).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].description.as_deref(), Some("NFT channel, pH 6.0"));
    }

    #[tokio::test]
    async fn metrics_count_requests_per_route() {
        let app = app(IngestAuth::Open);
        create_sensors(&app, 1).await;
        send(&app, get_req("/healthz")).await;
        send(&app, post_json("/ingest", &json!({"sensor_id": 1, "metric": "ph", "value": 7.0}), None)).await;

        let response = app.router.clone().oneshot(get_req("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], metrics::CONTENT_TYPE);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();

        assert!(text.contains("http_requests_total{method=\"GET\",endpoint=\"/healthz\"} 1\n"));
        assert!(text.contains("http_requests_total{method=\"POST\",endpoint=\"/sensors\"} 1\n"));
        assert!(text.contains("aics_readings_ingested_total 1\n"));
        assert_eq!(app.state.metrics.request_count("POST", "/ingest"), 1);
    }

    #[tokio::test]
    async fn unknown_paths_are_not_recorded() {
        let app = app(IngestAuth::Open);
        let (status, _) = send(&app, get_req("/wp-login.php")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        send(&app, get_req("/healthz")).await;

        let text = app.state.metrics.render();
        assert!(!text.contains("wp-login"));
        assert_eq!(text.matches("http_requests_total{").count(), 1);
        assert_eq!(app.state.metrics.request_count("GET", "/healthz"), 1);
    }
}
