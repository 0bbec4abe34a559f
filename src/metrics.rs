//! Prometheus metrics for SurveyShield.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`,
//! defines metric name constants, provides an axum middleware for HTTP RED
//! metrics, and exposes the `/metrics` endpoint handler.

use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "surveyshield_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "surveyshield_http_request_duration_seconds";

/// 1 while this instance is the elected writer, else 0 (gauge).
pub const IS_LEADER: &str = "surveyshield_is_leader";

/// Leadership state changes observed by this instance (counter).
pub const LEADERSHIP_TRANSITIONS_TOTAL: &str = "surveyshield_leadership_transitions_total";

/// Answers waiting in memory across all surveys (gauge).
pub const PENDING_RESPONSES: &str = "surveyshield_pending_responses";

/// Answers written to durable storage (counter). Labels: trigger.
pub const FLUSHED_RESPONSES_TOTAL: &str = "surveyshield_flushed_responses_total";

/// Flushes that failed and left their batch queued (counter).
pub const FLUSH_FAILURES_TOTAL: &str = "surveyshield_flush_failures_total";

/// Submissions handed to the leader instead of queued locally (counter).
/// Labels: outcome.
pub const FORWARDED_SUBMISSIONS_TOTAL: &str = "surveyshield_forwarded_submissions_total";

// -- Global recorder installation ---------------------------------------------

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent. Returns a
/// reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_gauge!(IS_LEADER, "Whether this instance is the elected writer");
    describe_counter!(
        LEADERSHIP_TRANSITIONS_TOTAL,
        "Leadership state changes on this instance"
    );
    describe_gauge!(PENDING_RESPONSES, "Answers queued in memory");
    describe_counter!(FLUSHED_RESPONSES_TOTAL, "Answers written to storage");
    describe_counter!(FLUSH_FAILURES_TOTAL, "Failed flush attempts");
    describe_counter!(
        FORWARDED_SUBMISSIONS_TOTAL,
        "Submissions forwarded to the leader"
    );
}

// -- Metrics middleware -------------------------------------------------------

/// Axum middleware that records HTTP RED metrics for every request.
///
/// Skips `/metrics` itself.  Must be the outermost layer.
pub async fn metrics_middleware(
    req: Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Collapse survey ids in a request path so metric labels stay bounded.
///
/// - `/status` -> `/status`
/// - `/surveys/42/responses` -> `/surveys/{id}/responses`
/// - `/internal/surveys/42/close` -> `/internal/surveys/{id}/close`
/// - anything unknown -> `/other`
fn normalize_path(path: &str) -> String {
    match path {
        "/" | "/health" | "/readyz" | "/status" | "/openapi.json" | "/metrics"
        | "/internal/ping" | "/internal/responses" => return path.to_string(),
        _ => {}
    }

    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["surveys", id, action] if id.parse::<i64>().is_ok() => {
            format!("/surveys/{{id}}/{action}")
        }
        ["internal", "surveys", id, action] if id.parse::<i64>().is_ok() => {
            format!("/internal/surveys/{{id}}/{action}")
        }
        _ => "/other".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` -- Render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = PROMETHEUS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_default();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fixed_paths() {
        assert_eq!(normalize_path("/health"), "/health");
        assert_eq!(normalize_path("/status"), "/status");
        assert_eq!(normalize_path("/internal/ping"), "/internal/ping");
    }

    #[test]
    fn test_normalize_survey_paths() {
        assert_eq!(
            normalize_path("/surveys/42/responses"),
            "/surveys/{id}/responses"
        );
        assert_eq!(normalize_path("/surveys/7/close"), "/surveys/{id}/close");
        assert_eq!(
            normalize_path("/internal/surveys/7/close"),
            "/internal/surveys/{id}/close"
        );
    }

    #[test]
    fn test_normalize_unknown_paths() {
        assert_eq!(normalize_path("/surveys/abc/close"), "/other");
        assert_eq!(normalize_path("/wp-admin/login.php"), "/other");
    }
}
