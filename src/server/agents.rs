// src/server/agents.rs
//
// =============================================================================
// TASKGRID: AGENT API (v 0.3)
// =============================================================================
//
// Registration, heartbeats, cascade cancel and operator directives.
//
// The heartbeat handler is the hot path: it stamps liveness, ingests a sub
// agent's log chunk and terminal report, then (for main agents) runs the
// scheduler synchronously and answers with an action directive.

use crate::core::{
    AgentKind, AgentRecord, AgentStatus, ApiEnvelope, HeartbeatAction, HeartbeatRequest,
    HeartbeatResponse, RegisterMainRequest, RegisterSubRequest, TaskStatus,
};
use crate::server::{ApiError, SharedState};
use crate::store::{StoreResult, TaskStore};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/agents", get(list_agents))
        .route("/api/agents/", get(list_agents))
        .route("/api/agents/main", post(register_main))
        .route("/api/agents/sub", post(register_sub))
        .route("/api/agents/check-status", post(check_status))
        .route("/api/agents/:id", get(get_agent))
        .route("/api/agents/:id/heartbeat", post(heartbeat))
        .route("/api/agents/:id/cancel", post(cancel_agent))
        .route("/api/agents/:id/directive", post(directive))
}

// ============================================================================
// 1. REGISTRATION & LISTING
// ============================================================================

async fn register_main(
    State(state): State<SharedState>,
    Json(req): Json<RegisterMainRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<AgentRecord>>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("missing required field: name".into()));
    }
    let agent = state
        .store
        .create_main_agent(&req.name, req.cpu_cores, &req.gpu_ids, Utc::now())?;
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok_message(agent, "main agent created")),
    ))
}

async fn register_sub(
    State(state): State<SharedState>,
    Json(req): Json<RegisterSubRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<AgentRecord>>), ApiError> {
    if req.name.is_empty() {
        return Err(ApiError::BadRequest("missing required field: name".into()));
    }
    let agent = state.store.create_sub_agent(&req, Utc::now())?;
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok_message(agent, "sub agent created")),
    ))
}

#[derive(Debug, Deserialize)]
struct AgentListQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
    status: Option<String>,
}

async fn list_agents(
    State(state): State<SharedState>,
    Query(query): Query<AgentListQuery>,
) -> Result<Json<ApiEnvelope<Vec<AgentRecord>>>, ApiError> {
    let kind = query.kind.as_deref().and_then(AgentKind::parse);
    let status = query.status.as_deref().and_then(AgentStatus::parse);
    let agents = state.store.list_agents(kind, status)?;
    Ok(Json(ApiEnvelope::ok(agents)))
}

async fn get_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ApiEnvelope<AgentRecord>>, ApiError> {
    let agent = state
        .store
        .get_agent(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("agent not found: id={}", id)))?;
    Ok(Json(ApiEnvelope::ok(agent)))
}

// ============================================================================
// 2. HEARTBEAT
// ============================================================================

async fn heartbeat(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<ApiEnvelope<HeartbeatResponse>>, ApiError> {
    let now = Utc::now();
    let store = &state.store;

    // An unknown or ended agent has nothing left to do.
    let Some(agent) = store.get_agent(&id)? else {
        log::warn!("Heartbeat from unknown agent {}", id);
        return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(
            HeartbeatAction::Stop,
        ))));
    };
    if agent.status == AgentStatus::End {
        return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(
            HeartbeatAction::Stop,
        ))));
    }

    store.apply_heartbeat(&id, &req.resource_info, now)?;

    // Sub agent: ingest the log chunk and any terminal report.
    if agent.kind == AgentKind::Sub {
        if let Some(task_id) = agent.task_id {
            if let Some(report) = &req.task_info {
                if let Some(log) = report.log.as_deref().filter(|l| !l.is_empty()) {
                    store.append_log(task_id, log)?;
                }

                if report.status.is_terminal() {
                    // A row that is already terminal (e.g. canceled by the
                    // operator) stays as it is; the agent still ends.
                    store.finish_task(task_id, report.status.as_task_status(), now)?;
                    store.set_agent_status(&id, AgentStatus::End)?;
                    store.release_sub_lease(&id)?;
                    return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(
                        HeartbeatAction::Continue,
                    ))));
                }
            }

            // A row that went terminal behind the agent's back (operator
            // cancel, watchdog failure) turns into a cooperative quit.
            if let Some(task) = store.get_task(task_id)? {
                if task.status.is_terminal() {
                    log::info!(
                        "Task {} is {}, sending quit to sub agent {}",
                        task_id,
                        task.status.as_str(),
                        id
                    );
                    return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(
                        HeartbeatAction::Quit,
                    ))));
                }
            }
        }
    }

    // Operator directives preempt scheduling.
    if let Some(directive) = store.take_pending_directive(&id)? {
        if let Some(action) = HeartbeatAction::parse(&directive) {
            log::info!("Delivering directive {} to agent {}", directive, id);
            return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(action))));
        }
        log::warn!("Dropping malformed directive {:?} for agent {}", directive, id);
    }

    // Main agent: try to hand out work.
    if agent.kind == AgentKind::Main {
        let refreshed = store
            .get_agent(&id)?
            .ok_or_else(|| ApiError::NotFound(format!("agent not found: id={}", id)))?;
        if let Some(assignment) = state.scheduler.dispatch_for(&refreshed, now)? {
            return Ok(Json(ApiEnvelope::ok(HeartbeatResponse::new_task(assignment))));
        }
    }

    Ok(Json(ApiEnvelope::ok(HeartbeatResponse::plain(
        HeartbeatAction::Continue,
    ))))
}

// ============================================================================
// 3. CANCEL & DIRECTIVES & WATCHDOG
// ============================================================================

async fn cancel_agent(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    let agent = state
        .store
        .get_agent(&id)?
        .ok_or_else(|| ApiError::NotFound(format!("agent not found: id={}", id)))?;

    cancel_cascade(&state.store, &agent, Utc::now())?;
    Ok(Json(ApiEnvelope::message("agent canceled")))
}

/// Cancel an agent and everything below it. A main agent takes its online
/// sub agents down with it; a sub agent fails its running task and returns
/// its lease.
fn cancel_cascade(store: &TaskStore, agent: &AgentRecord, now: DateTime<Utc>) -> StoreResult<()> {
    if agent.kind == AgentKind::Main {
        for sub in store.sub_agents_of(&agent.id)? {
            if sub.status == AgentStatus::Online {
                cancel_cascade(store, &sub, now)?;
            }
        }
    }

    if agent.kind == AgentKind::Sub {
        if let Some(task_id) = agent.task_id {
            if let Some(task) = store.get_task(task_id)? {
                if task.status == TaskStatus::Running {
                    store.finish_task(task_id, TaskStatus::Failed, now)?;
                    let _ = store.append_log(
                        task_id,
                        &format!("task failed: agent {} canceled", agent.id),
                    );
                }
            }
        }
        store.release_sub_lease(&agent.id)?;
    }

    // The next heartbeat (if the process is still alive) turns into a quit.
    if agent.status == AgentStatus::Online {
        store.set_pending_directive(&agent.id, "quit")?;
    }
    store.set_agent_status(&agent.id, AgentStatus::Offline)?;
    log::info!("Agent {} canceled", agent.id);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct DirectiveRequest {
    action: String,
}

/// Operator override delivered on the agent's next heartbeat.
async fn directive(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<DirectiveRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    match req.action.as_str() {
        "reject_new_task" | "accept_new_task" | "quit" => {}
        other => {
            return Err(ApiError::BadRequest(format!(
                "unsupported directive: {}",
                other
            )))
        }
    }
    state.store.set_pending_directive(&id, &req.action)?;
    Ok(Json(ApiEnvelope::message(format!(
        "directive {} queued",
        req.action
    ))))
}

#[derive(Debug, serde::Serialize)]
struct CheckStatusResult {
    offline_count: usize,
}

/// Force one watchdog pass; reports how many agents were newly offlined.
async fn check_status(
    State(state): State<SharedState>,
) -> Result<Json<ApiEnvelope<CheckStatusResult>>, ApiError> {
    let count = crate::server::run_watchdog_pass(
        &state.store,
        state.config.heartbeat_timeout,
        Utc::now(),
    )?;
    Ok(Json(ApiEnvelope::ok_message(
        CheckStatusResult {
            offline_count: count,
        },
        format!("{} agent(s) marked offline", count),
    )))
}
