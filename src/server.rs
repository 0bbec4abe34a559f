//! Axum router construction.
//!
//! The [`app`] function wires the public survey endpoints, the signed
//! inter-instance endpoints and the operational probes, and returns a
//! ready-to-serve [`axum::Router`].

use axum::{
    extract::State,
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;
use utoipa::OpenApi;

use crate::cluster::protocol::{self, Envelope, HEADER_INSTANCE, HEADER_SIGNATURE, HEADER_TIMESTAMP};
use crate::errors::{generate_request_id, ShieldError};
use crate::handlers::{internal, survey};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

// -- OpenAPI specification ----------------------------------------------------

/// OpenAPI documentation for the SurveyShield HTTP API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "SurveyShield API",
        version = "0.1.0",
        description = "Delayed, leader-elected persistence of anonymous survey responses"
    ),
    paths(
        health_check,
        readiness_check,
        survey::submit_responses,
        survey::close_survey,
        survey::status,
        internal::ping,
        internal::receive_responses,
        internal::close_survey,
    ),
    tags(
        (name = "Health", description = "Liveness and readiness probes"),
        (name = "Survey", description = "Response submission and survey lifecycle"),
        (name = "Internal", description = "Signed calls between instances"),
    )
)]
pub struct ApiDoc;

/// Build the axum [`Router`] with every route.
pub fn app(state: Arc<AppState>) -> Router {
    let internal_routes = Router::new()
        .route(protocol::PING_PATH, post(internal::ping))
        .route(protocol::TRANSFER_PATH, post(internal::receive_responses))
        .route("/internal/surveys/:id/close", post(internal::close_survey))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            peer_auth_middleware,
        ));

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(readiness_check))
        .route("/openapi.json", get(openapi_json))
        .route("/status", get(survey::status))
        .route("/surveys/:id/responses", post(survey::submit_responses))
        .route("/surveys/:id/close", post(survey::close_survey))
        .merge(internal_routes);

    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    let router = router
        .with_state(state.clone())
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http());

    if state.config.observability.metrics {
        router.layer(middleware::from_fn(metrics_middleware))
    } else {
        router
    }
}

// -- Request id middleware ----------------------------------------------------

/// Attach an `x-request-id` to every response that does not carry one yet.
async fn request_id_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    if !headers.contains_key("x-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-request-id", value);
        }
    }
    response
}

// -- Peer authentication ------------------------------------------------------

/// Verify the HMAC headers on inter-instance calls.
///
/// With no shared secret configured (single-instance deployments) every
/// internal call is refused.
async fn peer_auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ShieldError> {
    let secret = &state.config.cluster.shared_secret;
    if secret.is_empty() {
        return Err(ShieldError::Unauthorized(
            "inter-instance calls are disabled".to_string(),
        ));
    }

    // Owned copies; nothing may borrow `req` across `next.run(req).await`.
    let (instance, timestamp, signature) = {
        let headers = req.headers();
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        (
            header(HEADER_INSTANCE),
            header(HEADER_TIMESTAMP),
            header(HEADER_SIGNATURE),
        )
    };

    if let Err(reason) = protocol::verify(secret, &instance, &timestamp, &signature, chrono::Utc::now()) {
        let path = req.uri().path().to_string();
        warn!(peer = %instance, %path, %reason, "Rejected inter-instance request");
        return Err(ShieldError::Unauthorized(reason));
    }

    Ok(next.run(req).await)
}

// -- Health checks ------------------------------------------------------------

/// `GET /health` -- Process is up.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Health",
    operation_id = "HealthCheck",
    responses((status = 200, description = "Process is alive", body = Envelope))
)]
async fn health_check() -> Json<Envelope> {
    Json(Envelope::ok("ok"))
}

/// `GET /readyz` -- Leadership outcome known.
#[utoipa::path(
    get,
    path = "/readyz",
    tag = "Health",
    operation_id = "ReadinessCheck",
    responses(
        (status = 200, description = "Election outcome known", body = Envelope),
        (status = 503, description = "Still waiting for the first election check", body = Envelope)
    )
)]
async fn readiness_check(State(state): State<Arc<AppState>>) -> Response {
    let data = serde_json::json!({ "state": state.coordinator.state() });
    if state.coordinator.is_ready() {
        Json(Envelope::ok_with("ready", data)).into_response()
    } else {
        let body = Envelope {
            success: false,
            message: "leader election has not completed".to_string(),
            data: Some(data),
        };
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
