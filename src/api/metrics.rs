//! Request metrics in the Prometheus text exposition format.
//!
//! One `MetricsRegistry` is created at startup and shared with every request
//! through `AppState`.

use crate::api::handlers::AppState;
use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

const LATENCY_BUCKETS_SECONDS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

#[derive(Debug, Clone, Default)]
struct EndpointStats {
    requests: u64,
    // non-cumulative per-bucket counts; the last slot is +Inf
    buckets: [u64; LATENCY_BUCKETS_SECONDS.len() + 1],
    latency_sum_seconds: f64,
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    endpoints: Mutex<BTreeMap<(String, String), EndpointStats>>,
    readings_ingested: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_request(&self, method: &str, endpoint: &str, elapsed: Duration) {
        let seconds = elapsed.as_secs_f64();
        let slot = LATENCY_BUCKETS_SECONDS
            .iter()
            .position(|bound| seconds <= *bound)
            .unwrap_or(LATENCY_BUCKETS_SECONDS.len());

        let mut endpoints = self.endpoints.lock().unwrap_or_else(PoisonError::into_inner);
        let stats = endpoints
            .entry((method.to_string(), endpoint.to_string()))
            .or_default();
        stats.requests += 1;
        stats.buckets[slot] += 1;
        stats.latency_sum_seconds += seconds;
    }

    pub fn add_readings_ingested(&self, count: usize) {
        self.readings_ingested.fetch_add(count as u64, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub fn request_count(&self, method: &str, endpoint: &str) -> u64 {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(method.to_string(), endpoint.to_string()))
            .map(|s| s.requests)
            .unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut body = String::new();

        body.push_str("# HELP http_requests_total Total HTTP requests\n");
        body.push_str("# TYPE http_requests_total counter\n");
        for ((method, endpoint), stats) in &endpoints {
            let _ = writeln!(
                body,
                "http_requests_total{{method=\"{}\",endpoint=\"{}\"}} {}",
                method,
                escape_label(endpoint),
                stats.requests
            );
        }

        body.push_str("# HELP http_request_latency_seconds HTTP request latency in seconds\n");
        body.push_str("# TYPE http_request_latency_seconds histogram\n");
        for ((method, endpoint), stats) in &endpoints {
            let labels = format!("method=\"{}\",endpoint=\"{}\"", method, escape_label(endpoint));
            let mut cumulative = 0_u64;
            for (bound, count) in LATENCY_BUCKETS_SECONDS.iter().zip(stats.buckets.iter()) {
                cumulative += *count;
                let _ = writeln!(
                    body,
                    "http_request_latency_seconds_bucket{{{},le=\"{}\"}} {}",
                    labels, bound, cumulative
                );
            }
            let _ = writeln!(
                body,
                "http_request_latency_seconds_bucket{{{},le=\"+Inf\"}} {}",
                labels, stats.requests
            );
            let _ = writeln!(
                body,
                "http_request_latency_seconds_sum{{{}}} {}",
                labels, stats.latency_sum_seconds
            );
            let _ = writeln!(
                body,
                "http_request_latency_seconds_count{{{}}} {}",
                labels, stats.requests
            );
        }

        body.push_str("# HELP aics_readings_ingested_total Readings committed through /ingest\n");
        body.push_str("# TYPE aics_readings_ingested_total counter\n");
        let _ = writeln!(
            body,
            "aics_readings_ingested_total {}",
            self.readings_ingested.load(Ordering::Relaxed)
        );
        body
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Count and time requests, keyed by method and matched route. Requests
/// without a matched route are passed through unrecorded.
pub(crate) async fn track_requests(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    let Some(endpoint) = request.extensions().get::<MatchedPath>().map(|p| p.as_str().to_string()) else {
        return next.run(request).await;
    };
    let method = request.method().to_string();

    let started = Instant::now();
    let response = next.run(request).await;
    state.metrics.observe_request(&method, &endpoint, started.elapsed());
    response
}
