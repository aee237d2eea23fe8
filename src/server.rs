// src/server.rs
//
// =============================================================================
// TASKGRID: CONTROLLER HTTP SURFACE (v 0.3)
// =============================================================================
//
// The Lighthouse.
//
// Responsibilities:
// 1. Own the axum router for the agent/task/template APIs.
// 2. Map store errors onto the `{success, message}` envelope with sane
//    status codes; internal failures are logged at the boundary.
// 3. Run the watchdog: demote agents that stopped heartbeating, fail their
//    running tasks and return their leases.

use crate::config::Config;
use crate::core::{AgentKind, ApiEnvelope, TaskStatus};
use crate::scheduler::Scheduler;
use crate::store::{StoreError, StoreResult, TaskStore};
use anyhow::{Context, Result};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;

pub mod agents;
pub mod tasks;
pub mod templates;

// ============================================================================
// 1. STATE & ERRORS
// ============================================================================

pub struct AppState {
    pub store: TaskStore,
    pub scheduler: Scheduler,
    pub config: Config,
}

pub type SharedState = Arc<AppState>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TaskNotFound(_)
            | StoreError::AgentNotFound(_)
            | StoreError::TemplateNotFound(_) => ApiError::NotFound(err.to_string()),
            StoreError::UnknownDependency(_)
            | StoreError::DependencyCycle(_)
            | StoreError::DuplicateTemplate(_) => ApiError::BadRequest(err.to_string()),
            StoreError::Db(_) | StoreError::Io(_) => {
                log::error!("Store failure at API boundary: {}", err);
                ApiError::Internal(err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ApiEnvelope::<()>::error(self.to_string()))).into_response()
    }
}

// ============================================================================
// 2. ROUTER & SERVE
// ============================================================================

pub fn build_state(config: Config) -> Result<SharedState> {
    let store = TaskStore::open(config.database_path(), config.task_log_dir())
        .context("cannot open task store")?;
    let scheduler = Scheduler::new(store.clone());
    Ok(Arc::new(AppState {
        store,
        scheduler,
        config,
    }))
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .merge(agents::routes())
        .merge(tasks::routes())
        .merge(templates::routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind, start the background watchdog, serve until the process dies.
pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(config)?;
    spawn_watchdog(state.clone());

    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {}", addr))?;

    log::info!("Controller listening on {}", addr);
    let app = build_router(state);
    axum::serve(listener, app).await.context("server exited")?;
    Ok(())
}

/// Periodic liveness sweep at half the heartbeat timeout.
pub fn spawn_watchdog(state: SharedState) {
    let period = state.config.heartbeat_timeout / 2;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period.max(Duration::from_secs(1)));
        loop {
            tick.tick().await;
            match run_watchdog_pass(&state.store, state.config.heartbeat_timeout, Utc::now()) {
                Ok(0) => {}
                Ok(n) => log::warn!("Watchdog marked {} agent(s) offline", n),
                Err(e) => log::error!("Watchdog pass failed: {}", e),
            }
        }
    });
}

/// One watchdog pass: every online agent whose last heartbeat is older than
/// `timeout` goes offline. A dead sub agent fails its running task and
/// returns its lease to the main agent. Returns the newly-offline count.
pub fn run_watchdog_pass(
    store: &TaskStore,
    timeout: Duration,
    now: DateTime<Utc>,
) -> StoreResult<usize> {
    let cutoff = now - chrono::Duration::milliseconds(timeout.as_millis() as i64);
    let stale = store.stale_online_agents(cutoff)?;

    let mut count = 0;
    for agent in stale {
        log::warn!(
            "Agent {} ({}) missed heartbeats, marking offline",
            agent.id,
            agent.name
        );
        store.set_agent_status(&agent.id, crate::core::AgentStatus::Offline)?;
        count += 1;

        if agent.kind != AgentKind::Sub {
            continue;
        }

        if let Some(task_id) = agent.task_id {
            if let Some(task) = store.get_task(task_id)? {
                if task.status == TaskStatus::Running {
                    store.finish_task(task_id, TaskStatus::Failed, now)?;
                    // Best effort: the cause line helps post-mortems.
                    let _ = store.append_log(
                        task_id,
                        &format!("task failed: agent_offline (sub agent {})", agent.id),
                    );
                }
            }
        }
        store.release_sub_lease(&agent.id)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CreateTaskRequest, RegisterSubRequest};

    fn fixture() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(dir.path().join("t.db"), dir.path().join("logs")).unwrap();
        (dir, store)
    }

    #[test]
    fn watchdog_fails_running_task_and_releases_lease() {
        let (_dir, store) = fixture();
        let past = Utc::now() - chrono::Duration::seconds(60);

        let main = store
            .create_main_agent("w", 8, &["0".to_string()], past)
            .unwrap();
        let task = store
            .create_task(
                &CreateTaskRequest {
                    name: "t".into(),
                    template_type: "shell".into(),
                    script_content: "sleep 100".into(),
                    priority: 3,
                    cpu_cores: 2,
                    gpu_count: 1,
                    gpu_memory: 0,
                    depends_on: vec![],
                },
                past,
            )
            .unwrap();

        store.atomic_claim(task.id, &main.id, past).unwrap();
        store.debit_lease(&main.id, 2, &["0".to_string()]).unwrap();
        let sub = store
            .create_sub_agent(
                &RegisterSubRequest {
                    name: "s".into(),
                    main_agent_id: main.id.clone(),
                    task_id: task.id,
                    cpu_cores: Some(2),
                    gpu_ids: vec!["0".to_string()],
                },
                past,
            )
            .unwrap();

        // Keep the main agent alive; only the sub goes stale. The heartbeat
        // mirrors the agent's local ledger: two cores and GPU 0 leased out.
        let mut leased_gpu = crate::core::GpuInfo::idle("0");
        leased_gpu.is_available = false;
        let main_view = crate::core::ResourceInfo {
            cpu_cores: 8,
            available_cpu_cores: 6,
            gpu_info: vec![leased_gpu],
            gpu_ids: vec!["0".to_string()],
            ..Default::default()
        };
        store
            .apply_heartbeat(&main.id, &main_view, Utc::now())
            .unwrap();

        let count =
            run_watchdog_pass(&store, Duration::from_secs(10), Utc::now()).unwrap();
        assert_eq!(count, 1);

        let task = store.get_task(task.id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.end_time.is_some());

        let sub = store.get_agent(&sub.id).unwrap().unwrap();
        assert_eq!(sub.status, crate::core::AgentStatus::Offline);

        let main = store.get_agent(&main.id).unwrap().unwrap();
        assert_eq!(main.available_cpu_cores, 8);
        assert_eq!(main.available_gpu_ids(), vec!["0".to_string()]);

        let log = store.read_log(task.id, 0, None).unwrap();
        assert!(log.content.contains("agent_offline"));
    }

    #[test]
    fn watchdog_ignores_fresh_agents() {
        let (_dir, store) = fixture();
        store.create_main_agent("w", 4, &[], Utc::now()).unwrap();
        let count =
            run_watchdog_pass(&store, Duration::from_secs(10), Utc::now()).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn api_error_maps_store_errors_to_status_classes() {
        let not_found: ApiError = StoreError::TaskNotFound(7).into();
        assert!(matches!(not_found, ApiError::NotFound(_)));

        let bad: ApiError = StoreError::DependencyCycle(7).into();
        assert!(matches!(bad, ApiError::BadRequest(_)));

        let bad: ApiError = StoreError::UnknownDependency(9).into();
        assert!(matches!(bad, ApiError::BadRequest(_)));
    }
}
