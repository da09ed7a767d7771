//! Prometheus metrics endpoint and HTTP request tracking middleware.
//!
//! This module provides:
//! - A `/metrics` endpoint that returns Prometheus-formatted metrics
//! - Middleware for tracking HTTP request counts and durations
//! - Counters for SMS delivery outcomes, recorded by the SMS worker

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::AppState;

// Metric names as constants for consistency
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const SMS_MESSAGES_TOTAL: &str = "sms_messages_total";
pub const SMS_QUEUE_PENDING: &str = "sms_queue_pending";
pub const BOOKINGS_ACTIVE: &str = "bookings_active";

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// This should be called once during application startup.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    describe_counter!(
        HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests received"
    );
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(
        SMS_MESSAGES_TOTAL,
        "SMS delivery attempts by outcome (sent/retried/failed)"
    );
    describe_counter!(
        super::rate_limit::RATE_LIMITED_TOTAL,
        "Requests rejected by the rate limiter, by tier"
    );
    describe_gauge!(SMS_QUEUE_PENDING, "SMS jobs waiting for delivery");
    describe_gauge!(BOOKINGS_ACTIVE, "Active bookings across all businesses");

    Ok(handle)
}

/// GET /metrics - Returns Prometheus-formatted metrics.
///
/// This endpoint is accessible without authentication.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    update_gauge_metrics(&state).await;

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

async fn update_gauge_metrics(state: &AppState) {
    if let Ok(count) = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM sms_jobs WHERE status IN ('queued', 'processing')",
    )
    .fetch_one(&state.db)
    .await
    {
        gauge!(SMS_QUEUE_PENDING).set(count as f64);
    }

    if let Ok(count) =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM bookings WHERE status = 'active'")
            .fetch_one(&state.db)
            .await
    {
        gauge!(BOOKINGS_ACTIVE).set(count as f64);
    }
}

/// Middleware to track HTTP request metrics.
///
/// Records:
/// - `http_requests_total` counter with method, path, and status labels
/// - `http_request_duration_seconds` histogram with method and path labels
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    // Matched route template keeps tokens and ids out of the labels
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_sms_sent() {
    counter!(SMS_MESSAGES_TOTAL, "status" => "sent").increment(1);
}

pub fn record_sms_retried() {
    counter!(SMS_MESSAGES_TOTAL, "status" => "retried").increment(1);
}

pub fn record_sms_failed() {
    counter!(SMS_MESSAGES_TOTAL, "status" => "failed").increment(1);
}
