pub mod container;
mod models;
pub mod normalize;
mod service;
pub mod session;
mod store;

pub use container::{ContainerHandle, ContainerRuntime, ContainerSpec, DockerEngine, RuntimeError};
pub use models::*;
pub use normalize::normalize;
pub use service::ExecutionService;
pub use session::ContainerSession;
pub use store::{RunRecordStore, RunStore};

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use std::fmt::Write as _;
use tracing::{info, warn};

use crate::auth::CurrentUser;
use crate::error::ServiceError;
use crate::server::AppState;

/// Execution routes; all of them expect an authenticated [`CurrentUser`].
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/scripts/:id/run", post(run_script))
        .route("/executions/:id", get(get_execution))
        .route("/executions/:id/logs", get(get_execution_logs))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn run_script(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(script_id): Path<String>,
) -> Result<Response, ServiceError> {
    match state.executions.submit(&script_id, user).await {
        Ok(execution_id) => {
            info!(execution = %execution_id, script = %script_id, user, "execution accepted");
            let body = ExecutionCreatedResponse {
                execution_id,
                status: ExecutionStatus::Running,
            };
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        Err(err) => {
            warn!(script = %script_id, user, error = %err, "failed to submit execution");
            Err(err)
        }
    }
}

async fn get_execution(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(execution_id): Path<String>,
) -> Result<Json<Execution>, ServiceError> {
    let execution = state.executions.get_status(&execution_id, user).await?;
    Ok(Json(execution))
}

async fn get_execution_logs(
    State(state): State<AppState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
    Path(execution_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ServiceError> {
    let entries = state.executions.get_logs(&execution_id, user).await?;

    if query.format.as_deref() == Some("text") {
        return Ok((
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            render_text(&entries),
        )
            .into_response());
    }

    let lines: Vec<LogLine> = entries.into_iter().map(LogLine::from).collect();
    Ok(Json(lines).into_response())
}

fn render_text(entries: &[LogEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        let _ = writeln!(out, "[{}] {}", entry.stream.as_str(), entry.content);
    }
    out
}
