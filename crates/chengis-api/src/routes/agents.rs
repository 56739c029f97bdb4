//! Agent wire protocol endpoints (master side).
//!
//! Agents register, heartbeat, and report build lifecycle events. Build
//! dispatch and cancellation travel the other way, from the
//! dispatcher's client to the agent.

use axum::extract::{Path, State};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

use chengis_core::ResourceId;
use chengis_core::agent::{Agent, AgentStatus};
use chengis_core::build::BuildStatus;
use chengis_core::event::{BuildEvent, EventType};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/{agent_id}/events", post(report_events))
        .route("/{agent_id}/status/{status}", post(set_status))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    name: String,
    url: String,
    #[serde(default)]
    labels: BTreeSet<String>,
    max_builds: u32,
    #[serde(default)]
    system_info: serde_json::Value,
    org_id: Option<ResourceId>,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    agent_id: ResourceId,
}

async fn register(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, ApiError> {
    if request.max_builds == 0 {
        return Err(ApiError::BadRequest("max_builds must be at least 1".into()));
    }
    let agent = Agent {
        id: ResourceId::new(),
        name: request.name,
        url: request.url,
        labels: request.labels,
        max_builds: request.max_builds,
        current_builds: 0,
        status: AgentStatus::Online,
        last_heartbeat: Utc::now(),
        system_info: request.system_info,
        org_id: request.org_id,
    };
    let stored = state.registry.register(agent).await?;
    state.dispatcher.wake();
    Ok(Json(RegisterResponse {
        agent_id: stored.id,
    }))
}

#[derive(Debug, Deserialize)]
struct HeartbeatRequest {
    agent_id: ResourceId,
    current_builds: u32,
    system_info: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct OkResponse {
    ok: bool,
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(request): Json<HeartbeatRequest>,
) -> Result<Json<OkResponse>, ApiError> {
    state
        .registry
        .heartbeat(request.agent_id, request.current_builds, request.system_info)
        .await?;
    state.dispatcher.wake();
    Ok(Json(OkResponse { ok: true }))
}

/// One lifecycle event reported by an agent while running a build.
#[derive(Debug, Deserialize)]
struct AgentEvent {
    build_id: ResourceId,
    event_type: String,
    stage_name: Option<String>,
    step_name: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

/// Agents stream build progress here; terminal events also finalize the
/// build row and free the agent's slot.
async fn report_events(
    State(state): State<AppState>,
    Path(agent_id): Path<ResourceId>,
    Json(events): Json<Vec<AgentEvent>>,
) -> Result<Json<OkResponse>, ApiError> {
    for reported in events {
        let Some(event_type) = EventType::parse(&reported.event_type) else {
            warn!(agent = %agent_id, event = %reported.event_type, "unknown event type from agent");
            continue;
        };
        let mut event = BuildEvent::new(reported.build_id, event_type)
            .with_data(reported.data.clone());
        event.stage_name = reported.stage_name;
        event.step_name = reported.step_name;
        state.events.append(&event).await?;
        state.bus.publish(event);

        if event_type == EventType::BuildCompleted {
            let status = reported
                .data
                .get("status")
                .and_then(|s| s.as_str())
                .and_then(BuildStatus::parse)
                .filter(|s| s.is_terminal())
                .unwrap_or(BuildStatus::Failure);
            let finalized = state
                .builds
                .finalize(
                    reported.build_id,
                    status,
                    reported.data.get("failed_step").and_then(|s| s.as_str()),
                    reported.data.get("error_message").and_then(|s| s.as_str()),
                )
                .await?;
            if finalized {
                info!(build = %reported.build_id, status = %status, agent = %agent_id, "remote build finished");
            }
            fetch_remote_artifacts(&state, agent_id, reported.build_id, &reported.data).await;
            state.registry.release(agent_id).await;
            state.registry.record_send_success(agent_id).await;
            state.dispatcher.wake();
        }
    }
    Ok(Json(OkResponse { ok: true }))
}

/// Pull the artifacts a remote build declared in its terminal event
/// (`data.artifacts: [names]`) into master-side artifact storage.
async fn fetch_remote_artifacts(
    state: &AppState,
    agent_id: chengis_core::ResourceId,
    build_id: chengis_core::ResourceId,
    data: &serde_json::Value,
) {
    let Some(names) = data.get("artifacts").and_then(|a| a.as_array()) else {
        return;
    };
    let Some(agent) = state.registry.get(agent_id).await else {
        warn!(agent = %agent_id, "cannot fetch artifacts from unknown agent");
        return;
    };
    for name in names.iter().filter_map(|n| n.as_str()) {
        match state.dispatcher.client.fetch_artifact(&agent, name).await {
            Ok(bytes) => {
                if let Err(e) = state
                    .runner
                    .artifacts
                    .store_bytes(build_id, name, &bytes)
                    .await
                {
                    warn!(build = %build_id, artifact = name, error = %e, "failed to store remote artifact");
                }
            }
            Err(e) => {
                warn!(build = %build_id, artifact = name, error = %e, "failed to fetch remote artifact");
            }
        }
    }
}

/// Operator control: drain or offline an agent. Draining stops new
/// assignments while in-flight builds complete.
async fn set_status(
    State(state): State<AppState>,
    Path((agent_id, status)): Path<(ResourceId, String)>,
) -> Result<Json<OkResponse>, ApiError> {
    let status = AgentStatus::parse(&status)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown agent status: {status}")))?;
    state.registry.set_status(agent_id, status).await?;
    Ok(Json(OkResponse { ok: true }))
}
