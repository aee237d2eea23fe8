// src/server/tasks.rs
//
// =============================================================================
// TASKGRID: TASK API (v 0.3)
// =============================================================================
//
// Creation with dependency validation, paginated listing, cancel, and the
// append-only log endpoints.

use crate::core::{ApiEnvelope, CreateTaskRequest, LogSlice, Task, TaskPage, TaskStatus};
use crate::server::{ApiError, SharedState};
use crate::store::TaskFilter;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/", post(create_task).get(list_tasks))
        .route("/api/tasks/:id", get(get_task).put(update_task))
        .route("/api/tasks/:id/cancel", post(cancel_task))
        .route("/api/tasks/:id/log", get(get_task_log).post(append_task_log))
}

async fn create_task(
    State(state): State<SharedState>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<Task>>), ApiError> {
    for (field, value) in [
        ("name", &req.name),
        ("template_type", &req.template_type),
        ("script_content", &req.script_content),
    ] {
        if value.is_empty() {
            return Err(ApiError::BadRequest(format!(
                "missing required field: {}",
                field
            )));
        }
    }

    let task = state.store.create_task(&req, Utc::now())?;
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok_message(task, "task created")),
    ))
}

#[derive(Debug, Deserialize)]
struct TaskListQuery {
    page: Option<i64>,
    per_page: Option<i64>,
    status: Option<String>,
    name: Option<String>,
    template_type: Option<String>,
    script_content: Option<String>,
}

async fn list_tasks(
    State(state): State<SharedState>,
    Query(query): Query<TaskListQuery>,
) -> Result<Json<ApiEnvelope<TaskPage>>, ApiError> {
    let filter = TaskFilter {
        status: query
            .status
            .as_deref()
            .map(|s| s.split(',').filter_map(TaskStatus::parse).collect())
            .unwrap_or_default(),
        name: query.name,
        template_type: query.template_type,
        script_content: query.script_content,
    };

    let page = state.store.list_tasks(
        &filter,
        query.page.unwrap_or(1),
        query.per_page.unwrap_or(10),
    )?;
    Ok(Json(ApiEnvelope::ok(page)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<Task>>, ApiError> {
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: id={}", id)))?;
    Ok(Json(ApiEnvelope::ok(task)))
}

async fn update_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(fields): Json<serde_json::Map<String, serde_json::Value>>,
) -> Result<Json<ApiEnvelope<Task>>, ApiError> {
    if fields.is_empty() {
        return Err(ApiError::BadRequest("no fields to update".into()));
    }
    let task = state.store.update_task_fields(id, &fields)?;
    Ok(Json(ApiEnvelope::ok_message(task, "task updated")))
}

/// Cancel is immediate for waiting/blocked tasks. A running task's row is
/// canceled here and its sub agent picks up a quit directive on its next
/// heartbeat. Cancel of an already-terminal task is a no-op success.
async fn cancel_task(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<Task>>, ApiError> {
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: id={}", id)))?;

    if task.status.is_terminal() {
        return Ok(Json(ApiEnvelope::ok_message(
            task,
            "task already in a terminal state",
        )));
    }

    state.store.finish_task(id, TaskStatus::Canceled, Utc::now())?;
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| ApiError::NotFound(format!("task not found: id={}", id)))?;
    Ok(Json(ApiEnvelope::ok_message(task, "task canceled")))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    start_line: Option<usize>,
    max_lines: Option<usize>,
}

async fn get_task_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<LogQuery>,
) -> Result<Json<ApiEnvelope<LogSlice>>, ApiError> {
    let slice = state
        .store
        .read_log(id, query.start_line.unwrap_or(0), query.max_lines)?;
    Ok(Json(ApiEnvelope::ok(slice)))
}

#[derive(Debug, Deserialize)]
struct AppendLogRequest {
    content: String,
}

async fn append_task_log(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<AppendLogRequest>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.store.append_log(id, &req.content)?;
    Ok(Json(ApiEnvelope::message("log appended")))
}
