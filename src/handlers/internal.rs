//! Endpoints peers call on the leader.
//!
//! Every route here sits behind the signature check in
//! [`crate::server`].  A non-leader answers leader-only calls with 409 and
//! points at the leader it knows of.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use tracing::{debug, info};

use crate::cluster::protocol::{Envelope, TransferRequest, HEADER_INSTANCE};
use crate::dss::SurveyId;
use crate::errors::ShieldError;
use crate::AppState;

/// `POST /internal/ping` -- Authenticated no-op.
#[utoipa::path(
    post,
    path = "/internal/ping",
    tag = "Internal",
    operation_id = "Ping",
    responses(
        (status = 200, description = "Signature accepted", body = Envelope),
        (status = 401, description = "Bad signature", body = Envelope)
    )
)]
pub async fn ping(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Json<Envelope> {
    debug!(peer = sender(&headers), "Ping from peer");
    Json(Envelope::ok_with(
        "pong",
        serde_json::json!({
            "instance": state.coordinator.identity().as_str(),
            "leader": state.coordinator.is_leader(),
        }),
    ))
}

/// `POST /internal/responses` -- Queue answers handed over by a follower.
#[utoipa::path(
    post,
    path = "/internal/responses",
    tag = "Internal",
    operation_id = "TransferResponses",
    request_body = TransferRequest,
    responses(
        (status = 200, description = "Answers queued; data.count holds how many", body = Envelope),
        (status = 409, description = "Not the leader", body = Envelope)
    )
)]
pub async fn receive_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TransferRequest>,
) -> Result<Json<Envelope>, ShieldError> {
    require_leader(&state)?;
    let count = state.scheduler.enqueue(body.survey_id, body.answers);
    debug!(peer = sender(&headers), survey_id = body.survey_id, count, "Accepted responses from peer");
    Ok(Json(Envelope::ok_with(
        "Responses queued",
        serde_json::json!({ "count": count }),
    )))
}

/// `POST /internal/surveys/{id}/close` -- Flush a survey on behalf of a peer.
#[utoipa::path(
    post,
    path = "/internal/surveys/{id}/close",
    tag = "Internal",
    operation_id = "CloseSurveyForPeer",
    params(("id" = i64, Path, description = "Survey id")),
    responses(
        (status = 200, description = "Queued answers persisted; data.count holds how many", body = Envelope),
        (status = 409, description = "Not the leader", body = Envelope)
    )
)]
pub async fn close_survey(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(survey_id): Path<SurveyId>,
) -> Result<Json<Envelope>, ShieldError> {
    require_leader(&state)?;
    let result = state.scheduler.flush_now(survey_id).await?;
    info!(peer = sender(&headers), survey_id, count = result.persisted, "Survey closed for peer");
    Ok(Json(Envelope::ok_with(
        "Survey closed",
        serde_json::json!({ "count": result.persisted }),
    )))
}

fn require_leader(state: &AppState) -> Result<(), ShieldError> {
    if state.coordinator.is_leader() {
        Ok(())
    } else {
        Err(ShieldError::NotLeader {
            leader: state.coordinator.current_leader(),
        })
    }
}

fn sender(headers: &HeaderMap) -> &str {
    headers
        .get(HEADER_INSTANCE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}
