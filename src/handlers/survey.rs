//! Public survey endpoints.
//!
//! A submission is accepted unconditionally.  On a follower in a
//! multi-instance fleet it is first handed to the leader; if that fails for
//! any reason it is queued locally instead, so the caller never sees a
//! failure caused by the fleet.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::cluster::protocol::Envelope;
use crate::config::DeploymentMode;
use crate::dss::{DssStatus, SubmittedAnswer, SurveyId};
use crate::errors::ShieldError;
use crate::metrics::FORWARDED_SUBMISSIONS_TOTAL;
use crate::AppState;

/// Body of `POST /surveys/{id}/responses`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitRequest {
    pub answers: Vec<SubmittedAnswer>,
}

/// `POST /surveys/{id}/responses` -- Accept a participant's answers.
#[utoipa::path(
    post,
    path = "/surveys/{id}/responses",
    tag = "Survey",
    operation_id = "SubmitResponses",
    params(("id" = i64, Path, description = "Survey id")),
    request_body = SubmitRequest,
    responses(
        (status = 200, description = "Answers accepted", body = Envelope),
        (status = 400, description = "Empty submission", body = Envelope)
    )
)]
pub async fn submit_responses(
    State(state): State<Arc<AppState>>,
    Path(survey_id): Path<SurveyId>,
    Json(body): Json<SubmitRequest>,
) -> Result<Json<Envelope>, ShieldError> {
    if body.answers.is_empty() {
        return Err(ShieldError::BadRequest("no answers submitted".to_string()));
    }

    if let Some(leader) = forward_target(&state) {
        match state
            .peer
            .transfer_responses(&leader, survey_id, &body.answers)
            .await
        {
            Ok(count) => {
                metrics::counter!(FORWARDED_SUBMISSIONS_TOTAL, "outcome" => "forwarded").increment(1);
                return Ok(Json(accepted(count)));
            }
            // A hand-off that timed out may still have reached the leader;
            // queueing here anyway makes delivery at-least-once.
            Err(e) => {
                metrics::counter!(FORWARDED_SUBMISSIONS_TOTAL, "outcome" => "queued_locally").increment(1);
                warn!(survey_id, leader = %leader, error = %e, "Hand-off to leader failed; queueing locally");
            }
        }
    }

    let count = state.scheduler.enqueue(survey_id, body.answers);
    Ok(Json(accepted(count)))
}

/// `POST /surveys/{id}/close` -- Flush everything queued for a survey.
///
/// The leader flushes itself; a follower asks the leader to do it.
#[utoipa::path(
    post,
    path = "/surveys/{id}/close",
    tag = "Survey",
    operation_id = "CloseSurvey",
    params(("id" = i64, Path, description = "Survey id")),
    responses(
        (status = 200, description = "Queued answers persisted; data.count holds how many", body = Envelope),
        (status = 409, description = "No leader known yet", body = Envelope),
        (status = 502, description = "Leader unreachable", body = Envelope)
    )
)]
pub async fn close_survey(
    State(state): State<Arc<AppState>>,
    Path(survey_id): Path<SurveyId>,
) -> Result<Json<Envelope>, ShieldError> {
    if state.coordinator.is_leader() {
        let result = state.scheduler.flush_now(survey_id).await?;
        info!(survey_id, count = result.persisted, "Survey closed");
        return Ok(Json(closed(result.persisted)));
    }

    let leader = match state.coordinator.mode() {
        DeploymentMode::Multi => state.coordinator.current_leader(),
        DeploymentMode::Single => None,
    };
    let Some(leader) = leader else {
        return Err(ShieldError::NotLeader { leader: None });
    };

    let count = state
        .peer
        .close_survey(&leader, survey_id)
        .await
        .map_err(|e| ShieldError::LeaderUnreachable {
            leader: leader.clone(),
            reason: e.to_string(),
        })?;
    info!(survey_id, leader = %leader, count, "Survey closed by leader");
    Ok(Json(closed(count)))
}

/// `GET /status` -- Pending totals and leadership of this instance.
#[utoipa::path(
    get,
    path = "/status",
    tag = "Survey",
    operation_id = "Status",
    responses((status = 200, description = "Scheduler snapshot", body = DssStatus))
)]
pub async fn status(State(state): State<Arc<AppState>>) -> Json<DssStatus> {
    Json(state.scheduler.status())
}

/// Leader to hand a submission to, when this instance should not keep it.
fn forward_target(state: &AppState) -> Option<String> {
    if state.coordinator.mode() != DeploymentMode::Multi
        || !state.config.cluster.forward_submissions
        || state.coordinator.is_leader()
    {
        return None;
    }
    state
        .coordinator
        .current_leader()
        .filter(|leader| leader != state.coordinator.identity().as_str())
}

fn accepted(count: usize) -> Envelope {
    Envelope::ok_with("Responses accepted", serde_json::json!({ "count": count }))
}

fn closed(count: usize) -> Envelope {
    Envelope::ok_with("Survey closed", serde_json::json!({ "count": count }))
}
