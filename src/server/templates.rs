// src/server/templates.rs
//
// Script template CRUD. Names are unique; tasks reference templates only by
// the free-form `template_type` string, so deletes never cascade.

use crate::core::{ApiEnvelope, Template};
use crate::server::{ApiError, SharedState};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/templates", post(create_template).get(list_templates))
        .route("/api/templates/", post(create_template).get(list_templates))
        .route(
            "/api/templates/:id",
            get(get_template).put(update_template).delete(delete_template),
        )
}

#[derive(Debug, Deserialize)]
struct TemplateRequest {
    name: String,
    content: String,
}

async fn create_template(
    State(state): State<SharedState>,
    Json(req): Json<TemplateRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<Template>>), ApiError> {
    if req.name.is_empty() || req.content.is_empty() {
        return Err(ApiError::BadRequest(
            "template requires name and content".into(),
        ));
    }
    let template = state
        .store
        .create_template(&req.name, &req.content, Utc::now())?;
    Ok((
        StatusCode::CREATED,
        Json(ApiEnvelope::ok_message(template, "template created")),
    ))
}

async fn list_templates(
    State(state): State<SharedState>,
) -> Result<Json<ApiEnvelope<Vec<Template>>>, ApiError> {
    Ok(Json(ApiEnvelope::ok(state.store.list_templates()?)))
}

async fn get_template(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<Template>>, ApiError> {
    let template = state
        .store
        .get_template(id)?
        .ok_or_else(|| ApiError::NotFound(format!("template not found: id={}", id)))?;
    Ok(Json(ApiEnvelope::ok(template)))
}

async fn update_template(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<TemplateRequest>,
) -> Result<Json<ApiEnvelope<Template>>, ApiError> {
    let template = state.store.update_template(id, &req.name, &req.content)?;
    Ok(Json(ApiEnvelope::ok_message(template, "template updated")))
}

async fn delete_template(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<Json<ApiEnvelope<()>>, ApiError> {
    state.store.delete_template(id)?;
    Ok(Json(ApiEnvelope::message("template deleted")))
}
