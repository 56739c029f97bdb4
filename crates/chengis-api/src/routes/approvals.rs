//! Build control: approval gate responses and cancellation.
//!
//! The approval state machine lives in core; the endpoint loads the
//! gate, applies one user's decision and persists the transition. The
//! runner polling the gate observes the resolution and resumes or fails
//! the build.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use chengis_core::ResourceId;
use chengis_core::approval::{Decision, GateStatus};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{build_id}/approvals/{stage}", post(respond))
        .route("/{build_id}/cancel", post(cancel))
}

#[derive(Debug, Deserialize)]
struct RespondRequest {
    user: String,
    decision: Decision,
}

#[derive(Debug, Serialize)]
struct RespondResponse {
    status: GateStatus,
}

async fn respond(
    State(state): State<AppState>,
    Path((build_id, stage)): Path<(ResourceId, String)>,
    Json(request): Json<RespondRequest>,
) -> Result<Json<RespondResponse>, ApiError> {
    let mut gate = state
        .approvals
        .get(build_id, &stage)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no approval gate for stage {stage}")))?;

    let now = Utc::now();
    let status = gate.respond(&request.user, request.decision, now)?;
    state
        .approvals
        .add_response(gate.id, &request.user, request.decision, now)
        .await?;
    if status.is_terminal() {
        state.approvals.resolve(gate.id, status).await?;
    }

    let build = state.builds.get(build_id).await?;
    state
        .audit
        .append(
            build.org_id,
            Some(&request.user),
            match request.decision {
                Decision::Approve => "approval-approved",
                Decision::Reject => "approval-rejected",
            },
            "approval-gate",
            &gate.id.to_string(),
            json!({ "stage": stage, "gate_status": status.as_str() }),
        )
        .await?;

    info!(build = %build_id, stage = %stage, user = %request.user, status = %status, "approval response recorded");
    Ok(Json(RespondResponse { status }))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    ok: bool,
}

/// Record abort intent. The runner observes it at stage and step
/// boundaries; a build running on a remote agent also gets a cancel
/// request over the wire.
async fn cancel(
    State(state): State<AppState>,
    Path(build_id): Path<ResourceId>,
) -> Result<Json<CancelResponse>, ApiError> {
    let build = state.builds.get(build_id).await?;
    if build.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "build is already {}",
            build.status
        )));
    }
    state.builds.request_cancel(build_id).await?;

    if let Some(agent_id) = build.agent_id {
        if let Some(agent) = state.registry.get(agent_id).await {
            if let Err(e) = state.dispatcher.client.cancel(&agent, build_id).await {
                warn!(build = %build_id, agent = %agent.name, error = %e, "failed to relay cancel to agent");
            }
        }
    }

    info!(build = %build_id, "cancellation requested");
    Ok(Json(CancelResponse { ok: true }))
}
